//! Production adapters behind the core's collaborator traits.
//!
//! `PgProfileStore` reads profiles from the planforge database.
//! `CommandGenerator` spawns a configured external command per request,
//! writes the profile and context as JSON on its stdin, and parses the
//! generated plan from its stdout.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use planforge_core::generator::{
    GeneratedPlan, GenerationContext, Generator, GeneratorError, ProfileStore, TransientKind,
    UserProfile,
};
use planforge_db::queries::profiles;

use crate::config::GeneratorSection;

// ---------------------------------------------------------------------------
// Profile store
// ---------------------------------------------------------------------------

pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn load(&self, user_id: Uuid) -> anyhow::Result<UserProfile> {
        let payload = profiles::get_profile(&self.pool, user_id)
            .await?
            .with_context(|| format!("no profile stored for user {user_id}"))?;
        Ok(UserProfile { user_id, payload })
    }
}

// ---------------------------------------------------------------------------
// Command generator
// ---------------------------------------------------------------------------

/// What the external command must print on stdout.
#[derive(Debug, Deserialize)]
struct CommandOutput {
    result_ref: String,
    #[serde(default)]
    insight_changes: Value,
}

pub struct CommandGenerator {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(section: &GeneratorSection) -> Self {
        Self {
            command: section.command.clone(),
            args: section.args.clone(),
            timeout: section.timeout(),
        }
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(
        &self,
        profile: &UserProfile,
        context: GenerationContext,
    ) -> Result<GeneratedPlan, GeneratorError> {
        let input = json!({
            "user_id": profile.user_id,
            "profile": profile.payload,
            "kind": context.kind(),
            "target_day": context.target_day(),
        });

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GeneratorError::Fatal(format!("failed to spawn {}: {e}", self.command)))?;

        // Write the request and close stdin so the command sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.to_string().as_bytes())
                .await
                .map_err(|e| GeneratorError::Fatal(format!("failed to write generator stdin: {e}")))?;
        }

        // kill_on_drop reaps the child if the timeout wins the race.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GeneratorError::Transient {
                kind: TransientKind::Timeout,
                detail: format!("{} exceeded {:?}", self.command, self.timeout),
            })?
            .map_err(|e| GeneratorError::Fatal(format!("failed to wait for generator: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GeneratorError::Fatal(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let parsed: CommandOutput =
            serde_json::from_slice(&output.stdout).map_err(|e| GeneratorError::Transient {
                kind: TransientKind::ValidationFailed,
                detail: format!("generator output failed validation: {e}"),
            })?;

        Ok(GeneratedPlan {
            result_ref: parsed.result_ref,
            insight_changes: parsed.insight_changes,
        })
    }
}
