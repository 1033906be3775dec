use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use rpc_lite::{BoxError, Resource};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tracing::info;

const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection is closed")]
    Closed,

    #[error("email '{0}' is already registered")]
    DuplicateEmail(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: u64,
    pub name: String,
    pub email: String,
}

/// SQL handle for the user tables.
///
/// Only the in-process `memory://{name}` data source is supported. The
/// handle is safe for concurrent use by every call.
#[derive(Debug)]
pub struct Database {
    name: String,
    users: DashMap<u64, UserRow, ahash::RandomState>,
    emails: DashMap<String, u64, ahash::RandomState>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Database {
    pub async fn connect(data_source: &str) -> Result<Self, BoxError> {
        let name = data_source
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| format!("unsupported data source '{data_source}'"))?;

        info!(database = %name, "Connected to database");
        Ok(Self {
            name: name.to_string(),
            users: DashMap::default(),
            emails: DashMap::default(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn insert_user(&self, name: &str, email: &str) -> Result<UserRow, DbError> {
        self.ensure_open()?;

        let id = match self.emails.entry(email.to_string()) {
            Entry::Occupied(_) => return Err(DbError::DuplicateEmail(email.to_string())),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(id);
                id
            }
        };

        let row = UserRow {
            id,
            name: name.to_string(),
            email: email.to_string(),
        };
        self.users.insert(id, row.clone());
        Ok(row)
    }

    pub async fn find_user(&self, id: u64) -> Result<Option<UserRow>, DbError> {
        self.ensure_open()?;
        Ok(self.users.get(&id).map(|row| row.value().clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(database = %self.name, users = self.users.len(), "Database connection closed");
        }
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.is_closed() {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Resource for Database {
    fn name(&self) -> &str {
        "database"
    }

    fn release(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            self.close();
            Ok(())
        }
        .boxed()
    }
}
