pub mod backup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod links;
pub mod persistence;
pub mod query;
pub mod schema;
pub mod store;
pub mod validation;
pub mod value;

pub use backup::{BackupEntry, BackupInfo, BackupManager, BackupValidation};
pub use config::{Durability, StoreConfig};
pub use crypto::{AesGcmCipher, Cipher};
pub use error::{Result, SealDbError};
pub use links::{LinkViolation, RepairReport};
pub use query::{
    Filter, Op, QueryBuilder, QueryOptions, QueryOutcome, QueryPlan, SearchOptions, SearchQuery,
    SearchResult, SortDirection, SortSpec,
};
pub use schema::Schema;
pub use store::{Store, StoreStats};
pub use validation::{Fallible, Validator};
