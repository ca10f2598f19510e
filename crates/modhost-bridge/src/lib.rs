//! Host-function bridges for modhost guests.
//!
//! Guests reach backing services through two import modules:
//!
//! - `kv`: key-value cache ([`KvBridge`], redis)
//! - `sql`: relational store ([`SqlBridge`], postgres)
//!
//! Data crosses the boundary as pointer/length pairs into the calling
//! guest's memory, and every function returns an `i32` that is either a
//! byte count or a negative [`Status`]. Backend failures never trap the
//! guest.
//!
//! ```ignore
//! let bridges = Bridges::connect(&config.bridges).await;
//! let mut linker = modhost_core::create_linker(&engine)?;
//! register_all(&mut linker, &bridges)?;
//! ```

pub mod kv;
pub mod linker;
pub mod sql;
pub mod status;

pub use kv::{KvBackend, KvBridge, RedisBackend};
pub use linker::{Bridges, KV_MODULE, SQL_MODULE, register_all, register_kv, register_sql};
pub use sql::{PostgresBackend, SqlBackend, SqlBridge};
pub use status::Status;
