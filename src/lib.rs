pub mod buffer;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod encoder;
pub mod error;
pub mod store;

mod entry;
mod executor;
mod hasher;
mod segment;
mod util;

pub use cipher::Cipher;
pub use config::{Config, Mode};
pub use encoder::{Encoder, StringSetEncoder};
pub use error::{Error, Result};
pub use store::{ObjectValue, Store, StoreBuilder, Value};
