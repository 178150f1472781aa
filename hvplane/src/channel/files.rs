//! Whole-file operations on the host filesystem.

use std::sync::Arc;
use std::time::Duration;

use hvplane_shared::errors::{HvError, HvResult};

use super::render::quote_path;
use super::{CommandChannel, CommandOutput, Target};
use crate::runtime::constants::datastore::WRITE_DELIMITER;

/// File helpers for the host, expressed as plain shell commands.
///
/// Edits are read-modify-write: read the file, transform the text locally,
/// write the whole file back.
#[derive(Clone)]
pub struct HostFiles {
    channel: Arc<dyn CommandChannel>,
    timeout: Duration,
    copy_timeout: Duration,
}

impl HostFiles {
    pub fn new(channel: Arc<dyn CommandChannel>, timeout: Duration, copy_timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            copy_timeout,
        }
    }

    async fn exec(&self, command: &str, timeout: Duration) -> HvResult<CommandOutput> {
        self.channel
            .run(&Target::Host, command, ".", timeout)
            .await?
            .ensure_success(&Target::Host, command)
    }

    pub async fn read(&self, path: &str) -> HvResult<String> {
        let output = self
            .exec(&format!("cat {}", quote_path(path)), self.timeout)
            .await?;
        Ok(output.stdout)
    }

    /// Replace `path` with `contents`. A trailing newline is added when missing.
    pub async fn write(&self, path: &str, contents: &str) -> HvResult<()> {
        if contents.lines().any(|l| l == WRITE_DELIMITER) {
            return Err(HvError::Config(format!(
                "refusing to write {}: contents contain the delimiter line",
                path
            )));
        }
        let body = if contents.ends_with('\n') || contents.is_empty() {
            contents.to_string()
        } else {
            format!("{}\n", contents)
        };
        let command = format!(
            "cat > {} << '{}'\n{}{}",
            quote_path(path),
            WRITE_DELIMITER,
            body,
            WRITE_DELIMITER
        );
        self.exec(&command, self.timeout).await?;
        Ok(())
    }

    pub async fn copy(&self, src: &str, dest: &str) -> HvResult<()> {
        tracing::debug!(src, dest, "Copying host file");
        self.exec(
            &format!("cp {} {}", quote_path(src), quote_path(dest)),
            self.copy_timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn make_dir(&self, dir: &str) -> HvResult<()> {
        self.exec(&format!("mkdir -p {}", quote_path(dir)), self.timeout)
            .await?;
        Ok(())
    }

    pub async fn remove_dir(&self, dir: &str) -> HvResult<()> {
        self.exec(&format!("rm -rf {}", quote_path(dir)), self.timeout)
            .await?;
        Ok(())
    }

    pub async fn exists(&self, path: &str) -> HvResult<bool> {
        let output = self
            .channel
            .run(
                &Target::Host,
                &format!("test -e {}", quote_path(path)),
                ".",
                self.timeout,
            )
            .await?;
        Ok(output.success())
    }
}
