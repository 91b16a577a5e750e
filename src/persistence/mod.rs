use sqlx::SqlitePool;

pub mod history;
pub mod jobs;
pub mod migrations;
pub mod routers;
pub mod settings;
pub mod versions;

pub type Db = SqlitePool;

pub use history::{HistoryListRow, HistoryRecord, HistoryStatus, NewHistoryRecord};
pub use jobs::{JobRecord, JobStatus, NewJob};
pub use routers::{NewRouter, RouterRecord, RouterStatus};
pub use settings::{KEY_BATCH_WAIT_MINUTES, KEY_GLOBAL_PASSWORD, KEY_GLOBAL_USERNAME};
pub use versions::FirmwareVersionRecord;
