//! Configuration persistence
//!
//! A JSON config file predeclares the tables and chains a deployment
//! expects, so `load` can stage them through one batch before any rules are
//! applied. The file also fixes the session's protocol family. Writes use
//! the atomic temp-file-then-rename pattern.

use crate::core::channel::MsgBody;
use crate::core::error::Result;
use crate::core::expr::Verdict;
use crate::core::family::Family;
use crate::core::rule::{Hook, HookPoint, builtin_hook};
use crate::core::session::Session;
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// One predeclared chain; base chains carry a hook (priority defaults to the
/// well-known value for the (table, chain) pair)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Verdict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

/// Declared ruleset skeleton plus the session family
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesetConfig {
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Default location of the config file under the XDG config dir
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("xtables.json"))
}

/// Loads the config from disk; a missing file yields the default (empty)
/// declaration set.
pub fn load_config(path: &Path) -> Result<RulesetConfig> {
    match std::fs::read_to_string(path) {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RulesetConfig::default()),
        Err(e) => Err(e.into()),
    }
}

/// Saves the config with a temp-file-then-rename write
pub fn save_config(path: &Path, config: &RulesetConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| crate::core::error::Error::Io(e.error))?;
    Ok(())
}

/// Stages the declared tables and chains into the session's batch; the
/// caller commits. Chains with a declared policy but no hook fall back to
/// the well-known hook of the (table, chain) pair.
pub fn apply_config(h: &mut Session, config: &RulesetConfig) -> Result<()> {
    for table in &config.tables {
        h.stage(MsgBody::AddTable {
            table: table.name.clone(),
        })?;
        for chain in &table.chains {
            let hook = match (chain.hook, chain.priority) {
                (Some(hook), priority) => Some(Hook {
                    hook,
                    priority: priority.unwrap_or_else(|| {
                        builtin_hook(&table.name, &chain.name).map_or(0, |known| known.priority)
                    }),
                }),
                (None, _) if chain.policy.is_some() => builtin_hook(&table.name, &chain.name),
                (None, _) => None,
            };
            h.stage(MsgBody::AddChain {
                table: table.name.clone(),
                chain: chain.name.clone(),
                hook,
                policy: chain.policy,
                counters: None,
            })?;
        }
    }
    info!(tables = config.tables.len(), "declared ruleset staged");
    Ok(())
}
