//! Feature-gated fault injection at merge phase boundaries.
//!
//! Compile with `--features failpoints` to enable injection. Without the
//! feature the `fp!()` macro expands to `Ok(())`.
//!
//! Names used by the merge orchestrator:
//!
//! | name                         | fires                                   |
//! |------------------------------|-----------------------------------------|
//! | `FP_MERGE_AFTER_OPEN`        | all inputs open, before merging         |
//! | `FP_MERGE_AFTER_PRIMITIVE`   | temporary compound written, journal not yet at `deleting` |
//! | `FP_MERGE_AFTER_FIRST_DELETE`| first input shard fully removed         |
//! | `FP_MERGE_BEFORE_ACTIVATE`   | all inputs removed, before the rename   |

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

/// What a failpoint does when reached.
#[derive(Clone, Debug)]
pub enum FailpointAction {
    /// No-op.
    Off,
    /// Return an error with the given message.
    Error(String),
    /// Panic with the given message (simulates the process dying mid-phase).
    Panic(String),
}

/// The error a failpoint set to [`FailpointAction::Error`] returns.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failpoint {name}: {message}")]
pub struct InjectedFault {
    pub name: String,
    pub message: String,
}

static REGISTRY: LazyLock<Mutex<HashMap<&'static str, FailpointAction>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Set a failpoint action.
pub fn set(name: &'static str, action: FailpointAction) {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name, action);
}

/// Clear a specific failpoint.
pub fn clear(name: &'static str) {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(name);
}

/// Run the action registered for `name`, if any.
///
/// # Panics
///
/// Panics if the action is [`FailpointAction::Panic`].
pub fn check(name: &str) -> Result<(), InjectedFault> {
    let registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    match registry.get(name) {
        None | Some(FailpointAction::Off) => Ok(()),
        Some(FailpointAction::Error(msg)) => Err(InjectedFault {
            name: name.to_owned(),
            message: msg.clone(),
        }),
        Some(FailpointAction::Panic(msg)) => {
            let msg = msg.clone();
            drop(registry);
            panic!("failpoint {name}: {msg}")
        }
    }
}

/// Failpoint injection point.
///
/// Usage: `fp!("FP_MERGE_BEFORE_ACTIVATE")?;`
#[cfg(feature = "failpoints")]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {
        $crate::failpoints::check($name)
    };
}

#[cfg(not(feature = "failpoints"))]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {{
        let _ = $name;
        Ok::<(), $crate::failpoints::InjectedFault>(())
    }};
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    /// Tests touching the shared registry use distinct names so they can run
    /// in parallel.
    #[test]
    fn check_unset_is_ok() {
        assert!(check("FP_TEST_UNSET").is_ok());
    }

    #[test]
    fn check_error_returns_fault() {
        set("FP_TEST_ERROR", FailpointAction::Error("injected".into()));
        let err = check("FP_TEST_ERROR").unwrap_err();
        assert_eq!(err.name, "FP_TEST_ERROR");
        assert!(err.to_string().contains("injected"));
        clear("FP_TEST_ERROR");
        assert!(check("FP_TEST_ERROR").is_ok());
    }

    #[test]
    fn off_action_is_noop() {
        set("FP_TEST_OFF", FailpointAction::Off);
        assert!(check("FP_TEST_OFF").is_ok());
        clear("FP_TEST_OFF");
    }

    #[test]
    #[should_panic(expected = "failpoint FP_TEST_PANIC: boom")]
    fn panic_action_panics() {
        set("FP_TEST_PANIC", FailpointAction::Panic("boom".into()));
        let _ = check("FP_TEST_PANIC");
    }

    /// The macro compiles to a `Result` in every feature configuration.
    #[test]
    fn fp_compiles_to_result() {
        let result: Result<(), InjectedFault> = crate::fp!("FP_TEST_COMPILE_CHECK");
        assert!(result.is_ok());
    }
}
