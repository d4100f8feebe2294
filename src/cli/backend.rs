//! Backend selection from the CLI --backend flag.

use crate::backend::resolve_backend;
use crate::engine::SessionOptions;
use crate::error::RuntimeError;

/// Resolve the --backend flag into backend names in preference order.
///
/// Accepted values: "auto" (the configured default) or a comma-separated list such as
/// "emulated,cpu".
pub fn resolve_backends(name: Option<&str>) -> Result<Vec<String>, RuntimeError> {
    match name.unwrap_or("auto") {
        "auto" => Ok(SessionOptions::default().backends),
        list => {
            let names: Vec<String> = list.split(',').map(|s| s.trim().to_string()).collect();
            for name in &names {
                resolve_backend(name)?;
            }
            Ok(names)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_backends_auto() {
        assert_eq!(resolve_backends(Some("auto")).unwrap(), vec!["cpu"]);
    }

    #[test]
    fn test_resolve_backends_none_defaults_to_auto() {
        assert_eq!(resolve_backends(None).unwrap(), vec!["cpu"]);
    }

    #[test]
    fn test_resolve_backends_list() {
        assert_eq!(
            resolve_backends(Some("emulated, cpu")).unwrap(),
            vec!["emulated", "cpu"]
        );
    }

    #[test]
    fn test_resolve_backends_unknown() {
        match resolve_backends(Some("cpu,tpu")) {
            Err(RuntimeError::Backend(msg)) => {
                assert!(msg.contains("Unknown backend 'tpu'"), "Error: {}", msg);
            }
            Err(other) => panic!("Expected Backend error, got: {:?}", other),
            Ok(_) => panic!("Expected error for unknown backend"),
        }
    }

    #[test]
    fn test_resolve_backends_empty_string() {
        assert!(resolve_backends(Some("")).is_err());
    }
}
