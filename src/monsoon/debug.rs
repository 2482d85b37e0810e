// Environment options and the debug variable registry
//
// Options are read once and cached for the life of the process, so
// flipping an environment variable after startup has no effect.
extern crate lazy_static;

use lazy_static::lazy_static;
use utils::log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn parse_bool(val: Option<&str>, default: bool) -> bool {
    match val {
        None => default,
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    parse_bool(std::env::var(name).ok().as_deref(), default)
}

lazy_static! {
    static ref EXIT_ON_DISCONNECT: bool = env_bool("IPC_EXIT_ON_DISCONNECT", false);
}

/// Whether a client disconnect should take the whole server down
/// with it. Useful under a session manager that restarts us per
/// application.
pub fn exit_on_disconnect() -> bool {
    *EXIT_ON_DISCONNECT
}

/// What a debug variable exposes
pub enum DebugValue {
    /// Live state, read at dump time
    Bool(Arc<AtomicBool>),
    /// A value fixed at startup
    Flag(bool),
}

pub struct DebugVar {
    dv_name: String,
    dv_value: DebugValue,
}

/// A named set of introspectable server variables
///
/// Registered at the end of init and removed first in teardown, so
/// a dump never observes partially initialized state.
pub struct DebugRegistry {
    dbr_root: String,
    dbr_vars: Vec<DebugVar>,
}

impl DebugRegistry {
    pub fn new(root: &str) -> Self {
        Self {
            dbr_root: root.to_string(),
            dbr_vars: Vec::new(),
        }
    }

    pub fn add_bool(&mut self, name: &str, var: Arc<AtomicBool>) {
        self.dbr_vars.push(DebugVar {
            dv_name: name.to_string(),
            dv_value: DebugValue::Bool(var),
        });
    }

    pub fn add_flag(&mut self, name: &str, value: bool) {
        self.dbr_vars.push(DebugVar {
            dv_name: name.to_string(),
            dv_value: DebugValue::Flag(value),
        });
    }

    pub fn len(&self) -> usize {
        self.dbr_vars.len()
    }

    /// Log the current value of every registered variable
    pub fn publish(&self) {
        log::info!("debug variables for {}:", self.dbr_root);
        for var in self.dbr_vars.iter() {
            let value = match &var.dv_value {
                DebugValue::Bool(b) => b.load(Ordering::Relaxed),
                DebugValue::Flag(f) => *f,
            };
            log::info!("  {} = {}", var.dv_name, value);
        }
    }
}

impl Drop for DebugRegistry {
    fn drop(&mut self) {
        log::debug!("removing debug variables for {}", self.dbr_root);
        self.dbr_vars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing() {
        assert!(parse_bool(Some("1"), false));
        assert!(parse_bool(Some("true"), false));
        assert!(parse_bool(Some("YES"), false));
        assert!(!parse_bool(Some("0"), true));
        assert!(!parse_bool(Some("off"), true));
        // Unparseable and missing values fall back
        assert!(parse_bool(Some("maybe"), true));
        assert!(!parse_bool(None, false));
    }

    #[test]
    fn registry_tracks_vars() {
        let live = Arc::new(AtomicBool::new(true));
        let mut reg = DebugRegistry::new("test");
        reg.add_bool("running", live.clone());
        reg.add_flag("exit_on_disconnect", false);

        assert_eq!(reg.len(), 2);
        // A dump must not panic with live and fixed entries mixed
        reg.publish();
    }
}
