use std::collections::BTreeMap;
use std::io;

use ccs_provider::ConfigRoot;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// The generated hook asks our own `api websearch` surface to run the
/// search so the downstream CLI never needs provider-specific search
/// plumbing. The launcher path is baked in as the current executable so the
/// hook never depends on PATH resolution.
fn hook_script(launcher: &str) -> String {
    format!(
        "#!/bin/sh\n\
         # Generated by ccs; edits are overwritten on the next launch.\n\
         if [ \"$CCS_WEBSEARCH_SKIP\" = \"1\" ]; then\n\
         \x20 exit 0\n\
         fi\n\
         exec '{launcher}' api websearch \"$@\"\n"
    )
}

fn mcp_companion(launcher: &str) -> String {
    serde_json::json!({
        "mcpServers": {
            "ccs-websearch": {
                "command": launcher,
                "args": ["api", "websearch-mcp"],
            }
        }
    })
    .to_string()
}

/// Installs the web-search hook script and its MCP companion under the
/// config root and returns the environment that points the downstream CLI
/// at them. Idempotent; existing files are rewritten in place.
pub fn ensure_hook(root: &ConfigRoot) -> io::Result<BTreeMap<String, String>> {
    let hooks_dir = root.hooks_dir();
    std::fs::create_dir_all(&hooks_dir)?;

    let launcher = std::env::current_exe()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|_| "ccs".to_string());

    let script_path = hooks_dir.join("websearch-hook.sh");
    ccs_provider::write_atomic(&script_path, hook_script(&launcher).as_bytes())?;
    #[cfg(unix)]
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;

    let mcp_path = hooks_dir.join("websearch-mcp.json");
    ccs_provider::write_atomic(&mcp_path, mcp_companion(&launcher).as_bytes())?;

    let mut env = BTreeMap::new();
    env.insert(
        "CCS_WEBSEARCH_HOOK".to_string(),
        script_path.display().to_string(),
    );
    env.insert(
        "CCS_WEBSEARCH_MCP".to_string(),
        mcp_path.display().to_string(),
    );
    Ok(env)
}

/// Environment that tells the hook to stay out of the way, for strategies
/// where the downstream CLI already provides search natively.
pub fn skip_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("CCS_WEBSEARCH_SKIP".to_string(), "1".to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hook_install_is_idempotent_and_executable() {
        let temp = TempDir::new().unwrap();
        let root = ConfigRoot::new(temp.path());

        let env = ensure_hook(&root).unwrap();
        let env_again = ensure_hook(&root).unwrap();
        assert_eq!(env, env_again);

        let script = root.hooks_dir().join("websearch-hook.sh");
        assert!(script.exists());
        #[cfg(unix)]
        {
            let mode = std::fs::metadata(&script).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111, "script is executable");
        }
        assert!(env.contains_key("CCS_WEBSEARCH_HOOK"));
    }
}
