//! Redis list/hash backend
//!
//! Every operation that touches more than one command runs as a MULTI/EXEC
//! pipeline so concurrent producers never observe a list above its bound and
//! a consumer never loses entries between LRANGE and LTRIM.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use super::backend::{PushOutcome, QueueBackend};
use crate::error::Result;

pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push(&self, key: &str, entries: Vec<Vec<u8>>, max_len: usize) -> Result<PushOutcome> {
        let mut conn = self.conn.clone();
        let (len,): (usize,) = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(entries)
            .cmd("LTRIM")
            .arg(key)
            .arg(-(max_len as i64))
            .arg(-1)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(PushOutcome {
            len: len.min(max_len),
            evicted: len.saturating_sub(max_len),
        })
    }

    async fn pop(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let (entries,): (Vec<Vec<u8>>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(count as i64 - 1)
            .cmd("LTRIM")
            .arg(key)
            .arg(count as i64)
            .arg(-1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_hash(&self, key: &str, fields: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in fields {
            hset.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .add_command(hset)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields)
    }
}
