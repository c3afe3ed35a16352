//! The base-backup control conversation with PostgreSQL.
//!
//! A non-exclusive backup is aborted by the server the moment the session
//! that issued `pg_start_backup` goes away, so `BackupSession` owns that
//! session for the whole duration of the backup and only releases it from
//! `stop`.

use std::future::Future;
use std::time::Duration;

use pgferry_core::{Error, Result};
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub user: String,
    pub password: String,
    /// Deadline, in seconds, for each control statement.
    pub statement_timeout: u64,
}

impl ConnectSettings {
    fn conninfo(&self) -> String {
        // driver defaults fill in host, port, and database
        format!("user={} password='{}'", self.user, self.password)
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.statement_timeout)
    }
}

/// The payload `pg_stop_backup(false)` hands back for non-exclusive
/// backups. `tablespace_map` is empty when the cluster has no tablespaces.
#[derive(Debug)]
pub struct StopBackup {
    pub backup_label: String,
    pub tablespace_map: String,
}

pub struct BackupSession {
    settings: ConnectSettings,
    exclusive: bool,
    client: Option<Client>,
}

impl BackupSession {
    /// Issue `pg_start_backup` and return the session handle the caller
    /// must later `stop`. Nothing may be copied before this returns.
    pub async fn start(
        settings: &ConnectSettings,
        label: &str,
        checkpoint: bool,
        exclusive: bool,
    ) -> Result<Self> {
        let client = connect(settings).await?;

        debug!(label, checkpoint, exclusive, "issuing pg_start_backup");
        run_with_deadline(
            settings.deadline(),
            client.query(
                "SELECT pg_start_backup($1, $2, $3)",
                &[&label, &checkpoint, &exclusive],
            ),
        )
        .await?;

        // an exclusive backup does not need the session once started
        let client = if exclusive { None } else { Some(client) };

        Ok(Self {
            settings: settings.clone(),
            exclusive,
            client,
        })
    }

    /// Issue `pg_stop_backup`. Returns the backup-label and tablespace-map
    /// payload for non-exclusive backups, `None` for exclusive ones (the
    /// server wrote `backup_label` into the data directory itself).
    pub async fn stop(self) -> Result<Option<StopBackup>> {
        if self.exclusive {
            let client = connect(&self.settings).await?;
            run_with_deadline(
                self.settings.deadline(),
                client.query("SELECT pg_stop_backup()", &[]),
            )
            .await?;
            return Ok(None);
        }

        let Some(client) = self.client else {
            return Err(Error::Postgres(
                "non-exclusive backup session was already released".to_string(),
            ));
        };

        let row = run_with_deadline(
            self.settings.deadline(),
            client.query_one(
                "SELECT lsn::text, labelfile, spcmapfile FROM pg_stop_backup(false)",
                &[],
            ),
        )
        .await?;

        let lsn: String = row.get(0);
        let backup_label: String = row.get(1);
        let tablespace_map: String = row.get(2);
        debug!(%lsn, "pg_stop_backup completed");

        Ok(Some(StopBackup {
            backup_label,
            tablespace_map,
        }))
    }
}

async fn connect(settings: &ConnectSettings) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(&settings.conninfo(), NoTls)
        .await
        .map_err(|e| Error::Postgres(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(error = %err, "postgres connection error");
        }
    });

    Ok(client)
}

async fn run_with_deadline<T>(
    deadline: Duration,
    statement: impl Future<Output = std::result::Result<T, tokio_postgres::Error>>,
) -> Result<T> {
    match timeout(deadline, statement).await {
        Ok(result) => result.map_err(|e| Error::Postgres(e.to_string())),
        Err(_) => Err(Error::Postgres(format!(
            "control statement exceeded the {}s deadline",
            deadline.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conninfo_rendering() {
        let settings = ConnectSettings {
            user: "postgres".to_string(),
            password: "s3cr&t pass".to_string(),
            statement_timeout: 60,
        };
        assert_eq!(settings.conninfo(), "user=postgres password='s3cr&t pass'");
    }

    #[tokio::test]
    async fn test_deadline_cuts_off_hung_statements() {
        let hung = std::future::pending::<std::result::Result<(), tokio_postgres::Error>>();
        let result = run_with_deadline(Duration::from_millis(10), hung).await;
        match result {
            Err(Error::Postgres(msg)) => assert!(msg.contains("deadline")),
            other => panic!("expected a deadline error, got {:?}", other.is_ok()),
        }
    }
}
