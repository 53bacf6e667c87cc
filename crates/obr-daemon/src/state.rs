//! Shared daemon state: loaded config, resolved workspace paths, the
//! process-wide write mutex and the held instance lock. Handlers receive
//! `State<Arc<ServerContext>>`; connections are opened per request.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use obr_config::{OpsConfig, WorkspacePaths};
use obr_db::SearchSettings;
use obr_error::{OpsError, Result};
use obr_lock::FileLock;

#[derive(Debug)]
pub struct ServerContext {
    pub config: OpsConfig,
    pub paths: WorkspacePaths,
    /// Serializes all mutations (pipeline, jobs, metadata CRUD). Reads never
    /// take it.
    pub write_lock: Mutex<()>,
    /// Exclusive instance lock on `canonical/.opsd.lock`; held until drop.
    _instance_lock: FileLock,
}

impl ServerContext {
    /// Bootstrap a workspace and claim the single-writer instance lock
    /// (timeout 0: refuse to start when another daemon owns the workspace).
    pub fn init(config: OpsConfig) -> Result<Arc<Self>> {
        let paths = WorkspacePaths::resolve(&config);
        paths.ensure()?;
        obr_db::init_db(&paths.db)?;

        let conn = obr_db::connect(&paths.db)?;
        obr_db::ensure_builtin_views(&conn, &obr_ids::iso_now(config.tz()?))?;
        drop(conn);

        let instance_lock = FileLock::acquire(&paths.daemon_lock, Duration::ZERO)
            .map_err(|e| OpsError::Io(format!("Failed to acquire opsd lock: {e}")))?;
        info!(workspace = %paths.workspace.display(), "workspace ready, instance lock held");

        Ok(Arc::new(Self {
            config,
            paths,
            write_lock: Mutex::new(()),
            _instance_lock: instance_lock,
        }))
    }

    pub fn connect(&self) -> Result<Connection> {
        obr_db::connect(&self.paths.db)
    }

    pub fn tz(&self) -> Result<Tz> {
        self.config.tz()
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            fts: self.config.index.fts,
            max_snippet_len: self.config.index.max_snippet_len,
        }
    }

    pub fn job_context(&self) -> obr_jobs::JobContext<'_> {
        obr_jobs::JobContext {
            config: &self.config,
            paths: &self.paths,
        }
    }
}
