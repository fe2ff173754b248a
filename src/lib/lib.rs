pub mod codec;
pub mod compile;
pub mod config;
pub mod env;
pub mod error;
pub mod expression;
pub mod key;
pub mod observability;
pub mod store;
pub mod val;

pub use compile::{FieldSettings, FilterSettings, SortDirection, SortSettings, TableSettings};
pub use config::{ResultStoreConfig, Sizes};
pub use env::{Environment, EnvironmentConfig, EnvironmentInfo};
pub use error::{Result, StoreError};
pub use expression::FieldIndex;
pub use key::{Key, KeyPart};
pub use store::{DataStore, DataStoreFactory, Item, Items, RawKey, StoreOptions, ValuesConsumer};
pub use val::Val;
