use std::path::PathBuf;

use tracing::{debug, warn};

/// Remote endpoint freshly minted tokens are mirrored to, when configured.
#[derive(Clone, Debug)]
pub struct UploadTarget {
    pub endpoint: String,
    pub bearer_token: Option<String>,
}

/// Publishes a token file to the remote endpoint on a background task.
///
/// Strictly fire-and-forget: the task has its own panic boundary, failures
/// are logged and never reach the flow that produced the token.
pub fn publish_token(target: UploadTarget, token_path: PathBuf) {
    tokio::spawn(async move {
        let task = tokio::spawn(upload(target, token_path));
        if let Err(err) = task.await {
            debug!(error = %err, "token upload task panicked");
        }
    });
}

async fn upload(target: UploadTarget, token_path: PathBuf) {
    let contents = match tokio::fs::read(&token_path).await {
        Ok(contents) => contents,
        Err(err) => {
            debug!(path = %token_path.display(), error = %err, "token upload skipped");
            return;
        }
    };

    let client = reqwest::Client::new();
    let mut request = client
        .post(&target.endpoint)
        .header("Content-Type", "application/json")
        .body(contents);
    if let Some(token) = &target.bearer_token {
        request = request.bearer_auth(token);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            debug!(path = %token_path.display(), "token published to remote endpoint");
        }
        Ok(response) => {
            warn!(
                status = %response.status(),
                "token upload failed; the local token is still valid"
            );
        }
        Err(err) => {
            warn!(error = %err, "token upload failed; the local token is still valid");
        }
    }
}
