use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use which::which;

/// Wipes every table, index and trigger, then rebuilds the file and checks it.
pub const CLEAR_SCHEMA_SQL: &str = "PRAGMA writable_schema = 1; \
delete from sqlite_master where type in ('table', 'index', 'trigger'); \
PRAGMA writable_schema = 0; VACUUM; PRAGMA INTEGRITY_CHECK;";

/// Shell command issued before [`CLEAR_SCHEMA_SQL`]. Shells built with
/// defensive mode on refuse writes to `sqlite_master` otherwise.
const DEFENSIVE_OFF: &str = ".dbconfig defensive off";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed ({status}): {output}")]
    Failed {
        command: &'static str,
        status: String,
        output: String,
    },
    #[error("{command} did not finish within {timeout:?}")]
    TimedOut {
        command: &'static str,
        timeout: Duration,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The three things the relay needs from a database engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Full logical dump of `db` as SQL text.
    async fn dump(&self, db: &Path) -> Result<Vec<u8>, EngineError>;

    /// Destroy the schema and contents of `db` in place.
    async fn clear(&self, db: &Path) -> Result<(), EngineError>;

    /// Execute the SQL script at `script` against `db`.
    async fn replay(&self, db: &Path, script: &Path) -> Result<(), EngineError>;
}

/// Runs the `sqlite3` command-line shell as a subprocess.
#[derive(Debug, Clone)]
pub struct SqliteShell {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl SqliteShell {
    pub fn new(binary: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Use `explicit` when given, otherwise find `sqlite3` on PATH.
    pub fn locate(explicit: Option<&Path>, timeout: Option<Duration>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.is_file() {
                bail!("sqlite3 binary {} does not exist", path.display());
            }
            return Ok(Self::new(path, timeout));
        }

        let binary = which("sqlite3").with_context(|| {
            "unable to find sqlite3 in PATH\n\
             \n\
             Please install the SQLite command-line shell:\n\
             - Ubuntu/Debian: sudo apt-get install sqlite3\n\
             - macOS: brew install sqlite\n\
             - Windows: download sqlite-tools from https://www.sqlite.org/download.html\n\
             or point --sqlite3 at an existing binary"
        })?;
        tracing::debug!("using sqlite3 in PATH: {}", binary.display());
        Ok(Self::new(binary, timeout))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(
        &self,
        command: &'static str,
        db: &Path,
        args: &[&str],
    ) -> Result<Output, EngineError> {
        let child = Command::new(&self.binary)
            .arg(db)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| EngineError::TimedOut { command, timeout })??,
            None => child.wait_with_output().await?,
        };

        if output.status.success() {
            Ok(output)
        } else {
            Err(EngineError::Failed {
                command,
                status: output.status.to_string(),
                output: combined_output(&output),
            })
        }
    }
}

#[async_trait]
impl Engine for SqliteShell {
    async fn dump(&self, db: &Path) -> Result<Vec<u8>, EngineError> {
        Ok(self.run("dump", db, &[".dump"]).await?.stdout)
    }

    async fn clear(&self, db: &Path) -> Result<(), EngineError> {
        self.run("schema clear", db, &[DEFENSIVE_OFF, CLEAR_SCHEMA_SQL])
            .await
            .map(drop)
    }

    async fn replay(&self, db: &Path, script: &Path) -> Result<(), EngineError> {
        self.run("replay", db, &[&read_command(script)])
            .await
            .map(drop)
    }
}

/// `.read` with the path double-quoted; the shell resolves backslash
/// escapes inside double quotes, so `\` and `"` are escaped.
fn read_command(script: &Path) -> String {
    let path = script.display().to_string();
    let mut quoted = String::with_capacity(path.len() + 2);
    for c in path.chars() {
        if c == '\\' || c == '"' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    format!(".read \"{quoted}\"")
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::{Engine, EngineError};

    /// Treats the database as opaque bytes: dump reads the file, replay copies
    /// the script over it. Failures can be switched on per operation.
    #[derive(Debug, Default)]
    pub struct FileCopyEngine {
        dumps: AtomicUsize,
        pub fail_dump: AtomicBool,
        pub fail_clear: AtomicBool,
        pub fail_replay: AtomicBool,
    }

    impl FileCopyEngine {
        pub fn dump_count(&self) -> usize {
            self.dumps.load(Ordering::SeqCst)
        }
    }

    fn injected(command: &'static str) -> EngineError {
        EngineError::Failed {
            command,
            status: "exit status: 1".to_string(),
            output: format!("injected {command} failure"),
        }
    }

    #[async_trait]
    impl Engine for FileCopyEngine {
        async fn dump(&self, db: &Path) -> Result<Vec<u8>, EngineError> {
            let result = if self.fail_dump.load(Ordering::SeqCst) {
                Err(injected("dump"))
            } else {
                tokio::fs::read(db).await.map_err(EngineError::from)
            };
            self.dumps.fetch_add(1, Ordering::SeqCst);
            result
        }

        async fn clear(&self, db: &Path) -> Result<(), EngineError> {
            if self.fail_clear.load(Ordering::SeqCst) {
                return Err(injected("schema clear"));
            }
            tokio::fs::write(db, b"").await?;
            Ok(())
        }

        async fn replay(&self, db: &Path, script: &Path) -> Result<(), EngineError> {
            if self.fail_replay.load(Ordering::SeqCst) {
                return Err(injected("replay"));
            }
            tokio::fs::copy(script, db).await?;
            Ok(())
        }
    }
}
