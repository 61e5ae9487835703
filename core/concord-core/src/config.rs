//! Kernel configuration.
//!
//! Everything an operator may want to tune lives here as data: staleness
//! thresholds, gate TTLs, the delegation allowlist, and every positive and
//! negative pattern set the classifier uses. Missing sections and fields take
//! the defaults below, so a config file only needs to name what it changes.
//!
//! Lookup order: `CONCORD_CONFIG`, then `<project>/.concord/config.toml`,
//! then `~/.concord/config.toml`. No file at all means defaults.

use chrono::Duration;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{CoordError, Result};

pub const CONFIG_ENV: &str = "CONCORD_CONFIG";
pub const STATE_DIR_ENV: &str = "CONCORD_STATE_DIR";
const HOME_DIR_NAME: &str = ".concord";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Returns `~/.concord`.
pub fn concord_home() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(HOME_DIR_NAME))
        .ok_or(CoordError::HomeDirNotFound)
}

/// Returns the state directory, honouring `CONCORD_STATE_DIR`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var(STATE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    Ok(concord_home()?.join("state"))
}

/// Candidate config files, highest priority first.
pub fn config_candidates(project_path: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            candidates.push(PathBuf::from(path));
        }
    }
    if let Some(project) = project_path {
        candidates.push(project.join(HOME_DIR_NAME).join(CONFIG_FILE_NAME));
    }
    if let Ok(home) = concord_home() {
        candidates.push(home.join(CONFIG_FILE_NAME));
    }
    candidates
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub claims: ClaimsConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
}

impl KernelConfig {
    /// Loads the first config file that exists, or defaults when none does.
    pub fn load(project_path: Option<&Path>) -> Result<Self> {
        for candidate in config_candidates(project_path) {
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| CoordError::io(format!("read config {}", path.display()), err))?;
        toml::from_str(&content).map_err(|err| CoordError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    #[serde(default = "default_legacy_max_age_secs")]
    pub legacy_max_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            sqlite_path: None,
            legacy_max_age_secs: default_legacy_max_age_secs(),
        }
    }
}

impl StoreConfig {
    pub fn legacy_max_age(&self) -> Duration {
        secs(self.legacy_max_age_secs)
    }
}

fn default_legacy_max_age_secs() -> u64 {
    4 * 60 * 60
}

// ─────────────────────────────────────────────────────────────────────────────
// Liveness
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Window used when listing live peers on session start.
    #[serde(default = "default_liveness_stale_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_heartbeat_debounce_secs")]
    pub heartbeat_debounce_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_liveness_stale_secs(),
            heartbeat_debounce_secs: default_heartbeat_debounce_secs(),
        }
    }
}

impl LivenessConfig {
    pub fn stale_after(&self) -> Duration {
        secs(self.stale_after_secs)
    }

    pub fn heartbeat_debounce(&self) -> Duration {
        secs(self.heartbeat_debounce_secs)
    }
}

fn default_liveness_stale_secs() -> u64 {
    15 * 60
}

fn default_heartbeat_debounce_secs() -> u64 {
    30
}

// ─────────────────────────────────────────────────────────────────────────────
// File claims
// ─────────────────────────────────────────────────────────────────────────────

/// What to do when another live session holds the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Deny,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_claim_stale_secs")]
    pub stale_after_secs: u64,
    /// Tools whose target file gets claimed before they run.
    #[serde(default = "default_tracked_tools")]
    pub tracked_tools: Vec<String>,
    /// Tracked tools that rewrite a file wholesale.
    #[serde(default = "default_destructive_tools")]
    pub destructive_tools: Vec<String>,
    #[serde(default = "default_destructive_policy")]
    pub destructive_policy: ConflictPolicy,
    #[serde(default = "default_soft_policy")]
    pub soft_policy: ConflictPolicy,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_after_secs: default_claim_stale_secs(),
            tracked_tools: default_tracked_tools(),
            destructive_tools: default_destructive_tools(),
            destructive_policy: default_destructive_policy(),
            soft_policy: default_soft_policy(),
        }
    }
}

impl ClaimsConfig {
    pub fn stale_after(&self) -> Duration {
        secs(self.stale_after_secs)
    }

    pub fn is_tracked(&self, tool_name: &str) -> bool {
        self.tracked_tools.iter().any(|t| t == tool_name)
    }

    pub fn policy_for(&self, tool_name: &str) -> ConflictPolicy {
        if self.destructive_tools.iter().any(|t| t == tool_name) {
            self.destructive_policy
        } else {
            self.soft_policy
        }
    }
}

fn default_claim_stale_secs() -> u64 {
    5 * 60
}

fn default_tracked_tools() -> Vec<String> {
    strings(&["Edit", "MultiEdit", "Write", "NotebookEdit"])
}

fn default_destructive_tools() -> Vec<String> {
    strings(&["Write"])
}

fn default_destructive_policy() -> ConflictPolicy {
    ConflictPolicy::Deny
}

fn default_soft_policy() -> ConflictPolicy {
    ConflictPolicy::Warn
}

// ─────────────────────────────────────────────────────────────────────────────
// Sweep
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// A sweep runs on roughly one invocation in `one_in`. Zero disables it.
    #[serde(default = "default_sweep_one_in")]
    pub one_in: u32,
    #[serde(default = "default_sweep_max_age_hours")]
    pub max_age_hours: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            one_in: default_sweep_one_in(),
            max_age_hours: default_sweep_max_age_hours(),
        }
    }
}

impl SweepConfig {
    pub fn max_age(&self) -> Duration {
        Duration::hours(self.max_age_hours)
    }
}

fn default_sweep_one_in() -> u32 {
    100
}

fn default_sweep_max_age_hours() -> i64 {
    24
}

// ─────────────────────────────────────────────────────────────────────────────
// Pattern sets
// ─────────────────────────────────────────────────────────────────────────────

/// Raw positive/negative regex lists. Compiled case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSetConfig {
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

impl PatternSetConfig {
    fn new(positive: &[&str], negative: &[&str]) -> Self {
        Self {
            positive: strings(positive),
            negative: strings(negative),
        }
    }
}

/// Hedges and soft refusals shared by every phase-advancing set.
const HEDGE_NEGATIVES: &[&str] = &[
    r"\?",
    r"\b(but|however|wait|hold on|hang on)\b",
    r"\b(maybe|perhaps|not sure|unsure|might)\b",
];

fn with_hedges(extra: &[&'static str]) -> Vec<&'static str> {
    HEDGE_NEGATIVES.iter().chain(extra.iter()).copied().collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestration gate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_orchestration_ttl_secs")]
    pub ttl_secs: u64,
    /// Tools that spawn a sub-agent.
    #[serde(default = "default_spawn_tools")]
    pub spawn_tools: Vec<String>,
    /// Sub-agent types counted as implementation agents. Empty means every
    /// spawn counts.
    #[serde(default = "default_implementation_agents")]
    pub implementation_agents: Vec<String>,
    /// Treat short enumerated replies as finished interview answers.
    #[serde(default)]
    pub answer_heuristic: bool,
    #[serde(default = "default_answer_heuristic_max_chars")]
    pub answer_heuristic_max_chars: usize,
    #[serde(default = "default_orchestration_activation")]
    pub activation: PatternSetConfig,
    #[serde(default = "default_orchestration_cancel")]
    pub cancel: PatternSetConfig,
    #[serde(default = "default_recon_complete")]
    pub recon_complete: PatternSetConfig,
    #[serde(default = "default_interview_complete")]
    pub interview_complete: PatternSetConfig,
    #[serde(default = "default_plan_approved")]
    pub plan_approved: PatternSetConfig,
    #[serde(default = "default_implementation_task")]
    pub implementation_task: PatternSetConfig,
    #[serde(default = "default_research_task")]
    pub research_task: PatternSetConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_orchestration_ttl_secs(),
            spawn_tools: default_spawn_tools(),
            implementation_agents: default_implementation_agents(),
            answer_heuristic: false,
            answer_heuristic_max_chars: default_answer_heuristic_max_chars(),
            activation: default_orchestration_activation(),
            cancel: default_orchestration_cancel(),
            recon_complete: default_recon_complete(),
            interview_complete: default_interview_complete(),
            plan_approved: default_plan_approved(),
            implementation_task: default_implementation_task(),
            research_task: default_research_task(),
        }
    }
}

impl OrchestrationConfig {
    pub fn ttl(&self) -> Duration {
        secs(self.ttl_secs)
    }
}

fn default_orchestration_ttl_secs() -> u64 {
    4 * 60 * 60
}

fn default_spawn_tools() -> Vec<String> {
    strings(&["Task", "Agent"])
}

fn default_implementation_agents() -> Vec<String> {
    strings(&[
        r"implement",
        r"coder",
        r"engineer",
        r"developer",
        r"builder",
        r"executor",
        r"general-purpose",
    ])
}

fn default_answer_heuristic_max_chars() -> usize {
    600
}

fn default_orchestration_activation() -> PatternSetConfig {
    PatternSetConfig::new(
        &[
            r"^\s*/orchestrate\b",
            r"\borchestrate\b",
            r"\b(use|start|enter|enable)\s+(the\s+)?orchestrat(ion|or)(\s+mode)?\b",
        ],
        &[
            r"\?",
            r"\b(don'?t|do not|no need to|without|never)\s+(\w+\s+){0,2}orchestrat",
            r"\b(stop|cancel|abort|exit|end)\s+(the\s+)?orchestrat",
        ],
    )
}

fn default_orchestration_cancel() -> PatternSetConfig {
    PatternSetConfig::new(
        &[
            r"^\s*/cancel\b",
            r"\b(cancel|abort|stop|exit|end|quit)\s+(the\s+)?(orchestration|orchestrator|workflow)\b",
        ],
        &[r"\b(don'?t|do not|never)\s+(cancel|abort|stop|exit|end|quit)\b"],
    )
}

fn default_recon_complete() -> PatternSetConfig {
    PatternSetConfig::new(
        &[
            r"\brecon(naissance)?\s+(is\s+)?(done|complete|finished)\b",
            r"\b(done|finished)\s+(exploring|investigating|with\s+(the\s+)?recon)\b",
            r"\b(start|begin)\s+(the\s+)?interview\b",
            r"\bask\s+(me\s+)?(your\s+)?(clarifying\s+)?questions\b",
        ],
        &with_hedges(&[r"\b(not|isn'?t|aren'?t)\s+(yet\s+)?(done|complete|finished)\b"]),
    )
}

fn default_interview_complete() -> PatternSetConfig {
    PatternSetConfig::new(
        &[
            r"\bthat'?s\s+all\b",
            r"\b(those|these)\s+are\s+(all\s+)?my\s+answers\b",
            r"\b(done|finished)\s+(answering|with\s+(the\s+)?(questions|interview))\b",
            r"\b(write|draft|make|create)\s+(up\s+)?(the\s+|a\s+)?plan\b",
            r"\bgo\s+ahead\s+(and\s+)?plan\b",
        ],
        &with_hedges(&[r"\b(one more|another question|not done)\b"]),
    )
}

fn default_plan_approved() -> PatternSetConfig {
    PatternSetConfig::new(
        &[
            r"\b(approved?|lgtm|ship it)\b",
            r"\blooks\s+good(\s+to\s+me)?\b",
            r"^\s*(yes|yep|yeah|ok(ay)?|sure)\b",
            r"\b(proceed|go\s+ahead|do\s+it|execute(\s+the)?\s+plan)\b",
        ],
        &with_hedges(&[
            r"\b(first|before|instead)\b",
            r"\b(not|don'?t|do not|no)\b",
            r"\b(double[- ]?check|reconsider|revise|change|adjust|tweak)\b",
        ]),
    )
}

fn default_implementation_task() -> PatternSetConfig {
    PatternSetConfig::new(
        &[r"\b(implement\w*|build|add|fix|refactor|create|migrate|port|rewrite)\b"],
        &[],
    )
}

fn default_research_task() -> PatternSetConfig {
    PatternSetConfig::new(
        &[r"\b(research|investigate|explore|analy[sz]e|explain|understand|compare|survey|audit)\b"],
        &[],
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Delegation gate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_delegation_ttl_secs")]
    pub ttl_secs: u64,
    /// Tools that edit files directly.
    #[serde(default = "default_mutation_tools")]
    pub mutation_tools: Vec<String>,
    /// Tools that run shell commands.
    #[serde(default = "default_shell_tools")]
    pub shell_tools: Vec<String>,
    #[serde(default = "default_test_commands")]
    pub test_commands: Vec<String>,
    /// Paths the gate never blocks (plans, notes, configuration).
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<String>,
    #[serde(default = "default_delegation_activation")]
    pub activation: PatternSetConfig,
    #[serde(default = "default_delegation_cancel")]
    pub cancel: PatternSetConfig,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_delegation_ttl_secs(),
            mutation_tools: default_mutation_tools(),
            shell_tools: default_shell_tools(),
            test_commands: default_test_commands(),
            allowlist: default_allowlist(),
            activation: default_delegation_activation(),
            cancel: default_delegation_cancel(),
        }
    }
}

impl DelegationConfig {
    pub fn ttl(&self) -> Duration {
        secs(self.ttl_secs)
    }
}

fn default_delegation_ttl_secs() -> u64 {
    60 * 60
}

fn default_mutation_tools() -> Vec<String> {
    strings(&["Edit", "MultiEdit", "Write", "NotebookEdit"])
}

fn default_shell_tools() -> Vec<String> {
    strings(&["Bash"])
}

/// Start of a simple command: line start or after `;`, `&`, `|` or `(`,
/// skipping `VAR=value` assignments and wrappers such as `env` or `npx`.
const COMMAND_POSITION: &str =
    r"(?m)(?:^|[;&|(])\s*(?:\w+=\S*\s+)*(?:(?:env|time|sudo|nice|exec|npx|bunx|pnpx)\s+)*";

fn default_test_commands() -> Vec<String> {
    [
        r"(cargo|go)\s+(test|nextest)\b",
        r"(npm|pnpm|yarn|bun)\s+(run\s+)?test\b",
        r"pytest\b",
        r"python3?\s+-m\s+(pytest|unittest)\b",
        r"(bundle\s+exec\s+)?(jest|vitest|mocha|rspec)\b",
        r"make\s+(test|check)\b",
    ]
    .iter()
    .map(|runner| format!("{}{}", COMMAND_POSITION, runner))
    .collect()
}

fn default_allowlist() -> Vec<String> {
    strings(&[
        r"(^|/)\.claude/",
        r"(^|/)\.concord/",
        r"(^|/)(PLAN|TODO|NOTES|CLAUDE)\.md$",
        r"(^|/)plans?/[^/]+\.md$",
        r"(^|/)[^/]*config[^/]*\.(toml|ya?ml|json)$",
    ])
}

fn default_delegation_activation() -> PatternSetConfig {
    PatternSetConfig::new(
        &[
            r"^\s*/delegate\b",
            r"\bdelegat(e|ion)\s+mode\b",
            r"\benforce\s+delegation\b",
            r"\b(delegate|hand\s+off)\s+(all\s+|everything\s+|the\s+work\s+)?to\s+(sub-?)?agents\b",
        ],
        &[
            r"\?",
            r"\b(don'?t|do not|stop|no longer|without|disable|exit|end|turn off)\b",
        ],
    )
}

fn default_delegation_cancel() -> PatternSetConfig {
    PatternSetConfig::new(
        &[
            r"^\s*/undelegate\b",
            r"\b(stop|end|exit|disable|cancel|turn\s+off)\s+(the\s+)?delegat(e|ion|ing)(\s+mode)?\b",
            r"\bno\s+more\s+delegation\b",
        ],
        &[],
    )
}

// ─────────────────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_sections_take_defaults() {
        let config: KernelConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(config.claims.stale_after(), Duration::minutes(5));
        assert_eq!(config.orchestration.ttl(), Duration::hours(4));
        assert_eq!(config.delegation.ttl(), Duration::hours(1));
        assert_eq!(config.sweep.one_in, 100);
        assert!(!config.orchestration.answer_heuristic);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: KernelConfig = toml::from_str(
            r#"
            [claims]
            stale_after_secs = 60
            soft_policy = "deny"

            [delegation.cancel]
            positive = ["^/off$"]
            "#,
        )
        .expect("parse config");

        assert_eq!(config.claims.stale_after(), Duration::seconds(60));
        assert_eq!(config.claims.soft_policy, ConflictPolicy::Deny);
        assert_eq!(config.claims.tracked_tools, default_tracked_tools());
        assert_eq!(config.delegation.cancel.positive, vec!["^/off$".to_string()]);
        assert!(config.delegation.cancel.negative.is_empty());
        assert_eq!(config.delegation.activation, default_delegation_activation());
    }

    #[test]
    fn sqlite_backend_parses() {
        let config: KernelConfig = toml::from_str(
            r#"
            [store]
            backend = "sqlite"
            sqlite_path = "/tmp/concord.db"
            "#,
        )
        .expect("parse config");
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(
            config.store.sqlite_path.as_deref(),
            Some(Path::new("/tmp/concord.db"))
        );
    }

    #[test]
    fn malformed_file_is_reported() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[claims\nstale_after_secs = ").unwrap();

        let err = KernelConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, CoordError::ConfigMalformed { .. }));
    }

    #[test]
    fn claim_policy_depends_on_tool() {
        let claims = ClaimsConfig::default();
        assert_eq!(claims.policy_for("Write"), ConflictPolicy::Deny);
        assert_eq!(claims.policy_for("Edit"), ConflictPolicy::Warn);
        assert!(claims.is_tracked("MultiEdit"));
        assert!(!claims.is_tracked("Read"));
    }
}
