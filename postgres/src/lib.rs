pub mod coordinator;

pub use coordinator::{BackupSession, ConnectSettings, StopBackup};
