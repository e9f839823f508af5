//! `monday edit`: open the configuration in the user's editor.

use crate::config;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let path = config::edit_path();
    let editor = editor_binary();

    let status = tokio::process::Command::new(&editor)
        .arg(&path)
        .status()
        .await
        .map_err(|e| format!("cannot launch editor '{editor}': {e}"))?;

    if !status.success() {
        return Err(format!("editor '{editor}' exited with {status}").into());
    }
    Ok(())
}

/// `MONDAY_EDITOR` wins over `EDITOR`; `vi` is the fallback.
fn editor_binary() -> String {
    std::env::var("MONDAY_EDITOR")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string())
}
