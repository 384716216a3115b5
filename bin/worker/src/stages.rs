//! Migration stage processors.
//!
//! These processors produce deterministic estimates from the request
//! context instead of calling out to platform APIs or a model. Each one
//! reads only the outputs of earlier stages, so retries are harmless.

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use stagehand_workflow::{StageFailure, StageInput, StageProcessor, StageRegistry};
use std::sync::Arc;

pub const DATA_ANALYSIS: &str = "data_analysis";
pub const MIGRATION_PLANNING: &str = "migration_planning";
pub const SEO_ANALYSIS: &str = "seo_analysis";
pub const COMMUNICATION_PLANNING: &str = "communication_planning";
pub const EXECUTION_PREPARATION: &str = "execution_preparation";

/// The default migration stage sequence.
pub const MIGRATION_STAGES: [&str; 5] = [
    DATA_ANALYSIS,
    MIGRATION_PLANNING,
    SEO_ANALYSIS,
    COMMUNICATION_PLANNING,
    EXECUTION_PREPARATION,
];

/// The default migration stage sequence, owned.
#[must_use]
pub fn migration_sequence() -> Vec<String> {
    MIGRATION_STAGES.iter().map(|s| (*s).to_string()).collect()
}

/// Registers every migration stage processor.
#[must_use]
pub fn registry() -> StageRegistry {
    StageRegistry::new()
        .with_stage(DATA_ANALYSIS, Arc::new(DataAnalysis))
        .with_stage(MIGRATION_PLANNING, Arc::new(MigrationPlanning))
        .with_stage(SEO_ANALYSIS, Arc::new(SeoAnalysis))
        .with_stage(COMMUNICATION_PLANNING, Arc::new(CommunicationPlanning))
        .with_stage(EXECUTION_PREPARATION, Arc::new(ExecutionPreparation))
}

/// Catalogue size estimate per supported source platform.
struct PlatformProfile {
    products: u64,
    customers: u64,
    orders: u64,
    complexity: &'static str,
}

fn platform_profile(platform: &str) -> Option<PlatformProfile> {
    let profile = match platform {
        "shopify" => PlatformProfile {
            products: 1_200,
            customers: 8_000,
            orders: 25_000,
            complexity: "medium",
        },
        "woocommerce" => PlatformProfile {
            products: 900,
            customers: 5_000,
            orders: 14_000,
            complexity: "medium",
        },
        "magento" => PlatformProfile {
            products: 4_000,
            customers: 20_000,
            orders: 90_000,
            complexity: "high",
        },
        "bigcommerce" | "wix" | "ideasoft" | "ikas" => PlatformProfile {
            products: 500,
            customers: 2_500,
            orders: 6_000,
            complexity: "low",
        },
        _ => return None,
    };
    Some(profile)
}

fn context_str<'a>(input: &StageInput<'a>, key: &str) -> Result<&'a str, StageFailure> {
    input
        .context
        .get(key)
        .and_then(JsonValue::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| StageFailure::InvalidInput {
            message: format!("context is missing '{key}'"),
        })
}

fn upstream<'a>(input: &StageInput<'a>, stage: &str) -> Result<&'a JsonValue, StageFailure> {
    input.payload(stage).ok_or_else(|| StageFailure::InvalidInput {
        message: format!("'{}' needs the output of '{stage}'", input.stage),
    })
}

/// Scans the source platform and sizes the catalogue.
pub struct DataAnalysis;

#[async_trait]
impl StageProcessor for DataAnalysis {
    async fn execute(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        let source = context_str(input, "source_platform")?;
        let destination = context_str(input, "destination_platform")?;
        let profile = platform_profile(source).ok_or_else(|| StageFailure::InvalidInput {
            message: format!("unsupported source platform '{source}'"),
        })?;

        Ok(json!({
            "source_platform": source,
            "destination_platform": destination,
            "structure_complexity": profile.complexity,
            "estimated_products": profile.products,
            "estimated_customers": profile.customers,
            "estimated_orders": profile.orders,
        }))
    }
}

/// Breaks the migration into phases with effort estimates.
pub struct MigrationPlanning;

#[async_trait]
impl StageProcessor for MigrationPlanning {
    async fn execute(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        let analysis = upstream(input, DATA_ANALYSIS)?;
        let (days, hours) = match analysis["structure_complexity"].as_str() {
            Some("low") => (7, 90),
            Some("high") => (28, 420),
            _ => (14, 200),
        };
        Ok(json!({
            "estimated_duration_days": days,
            "estimated_effort_hours": hours,
            "complexity_level": analysis["structure_complexity"],
            "phases": [
                { "name": "Analysis & Planning", "prerequisites": ["API access", "backup creation"] },
                { "name": "Data Migration", "prerequisites": ["Testing environment", "Data mapping"] },
                { "name": "Testing & Go-Live", "prerequisites": ["Migrated data", "UAT environment"] },
            ],
        }))
    }

    fn supports_fallback(&self) -> bool {
        true
    }

    async fn fallback(&self, _input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        Ok(json!({
            "estimated_duration_days": 14,
            "estimated_effort_hours": 200,
            "complexity_level": "medium",
            "confidence_score": 0.3,
            "phases": [],
        }))
    }
}

/// Estimates the SEO risk of moving between the two platforms.
pub struct SeoAnalysis;

#[async_trait]
impl StageProcessor for SeoAnalysis {
    async fn execute(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        let analysis = upstream(input, DATA_ANALYSIS)?;
        let products = analysis["estimated_products"].as_u64().unwrap_or(0);
        let risk_level = if analysis["source_platform"] == analysis["destination_platform"] {
            "low"
        } else if products > 2_000 {
            "high"
        } else {
            "medium"
        };
        Ok(json!({
            "risk_level": risk_level,
            "critical_pages_count": products / 10,
            "url_changes_required": risk_level != "low",
            "redirects_planned": products,
        }))
    }

    fn supports_fallback(&self) -> bool {
        true
    }

    async fn fallback(&self, _input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        Ok(json!({
            "risk_level": "medium",
            "critical_pages_count": 100,
            "url_changes_required": true,
            "redirects_planned": 0,
        }))
    }
}

/// Plans customer notices around the migration window.
pub struct CommunicationPlanning;

#[async_trait]
impl StageProcessor for CommunicationPlanning {
    async fn execute(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        let analysis = upstream(input, DATA_ANALYSIS)?;
        let plan = upstream(input, MIGRATION_PLANNING)?;
        Ok(json!({
            "approach": "transparent",
            "estimated_customer_count": analysis["estimated_customers"],
            "communication_timeline_days": plan["estimated_duration_days"],
            "templates": ["migration_announcement", "migration_complete"],
        }))
    }

    fn supports_fallback(&self) -> bool {
        true
    }

    async fn fallback(&self, _input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        Ok(json!({
            "approach": "transparent",
            "estimated_customer_count": 1_000,
            "communication_timeline_days": 14,
            "templates": ["migration_announcement", "migration_complete"],
        }))
    }
}

/// Checks that every earlier stage produced a real result.
pub struct ExecutionPreparation;

#[async_trait]
impl StageProcessor for ExecutionPreparation {
    async fn execute(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        let met = |stage: &str| input.output(stage).is_some_and(|output| !output.degraded);
        let prerequisites = json!({
            "analysis_completed": met(DATA_ANALYSIS),
            "plan_created": met(MIGRATION_PLANNING),
            "seo_analyzed": met(SEO_ANALYSIS),
            "communication_planned": met(COMMUNICATION_PLANNING),
        });
        let ready = MIGRATION_STAGES[..4].iter().copied().all(met);
        Ok(json!({
            "ready_for_execution": ready,
            "prerequisites_met": prerequisites,
            "execution_order": [
                "data_extraction",
                "data_transformation",
                "seo_setup",
                "data_loading",
                "verification",
                "go_live",
            ],
        }))
    }
}
