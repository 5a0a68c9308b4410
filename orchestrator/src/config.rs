//! Orchestrator tuning knobs.

use backoff::BackoffConfig;
use data_types::Symbol;

/// How the planner finds the symbol universe.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Reference dataset enumerated for symbols.
    pub symbol_source: String,

    /// Column of the reference dataset holding the symbol.
    pub symbol_column: String,

    /// Explicit symbol list; when non-empty the reference dataset is not
    /// consulted. Operator override and test hook.
    pub symbol_overrides: Vec<Symbol>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            symbol_source: "stock_basic".to_string(),
            symbol_column: "ts_code".to_string(),
            symbol_overrides: Vec::new(),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// FAST pool size. SLOW and MAINT are deliberately single-worker:
    /// one writer per dataset at a time keeps append ordering reasoning
    /// simple, and planning never interleaves with persistence.
    pub fast_workers: usize,

    /// Total attempts for a download before it dead-letters.
    pub max_download_attempts: u32,

    /// Total attempts for a persist before it dead-letters.
    pub max_persist_attempts: u32,

    /// Delay schedule between retry attempts.
    pub retry_backoff: BackoffConfig,

    /// Symbol-universe resolution.
    pub planner: PlannerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fast_workers: 8,
            max_download_attempts: 3,
            max_persist_attempts: 2,
            retry_backoff: BackoffConfig::default(),
            planner: PlannerConfig::default(),
        }
    }
}
