//! SQLite backend.

use super::{
    CandidateNode, ChainStore, Confirmation, InfoBlock, StoredBlock, TransactionStatus,
};
use crate::crypto::Hash;
use crate::error::{ChainError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS info_block (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        block_id INTEGER NOT NULL,
        hash BLOB NOT NULL,
        rollbacks_hash BLOB NOT NULL,
        node_position INTEGER NOT NULL,
        time INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS block_chain (
        id INTEGER PRIMARY KEY,
        hash BLOB NOT NULL,
        rollbacks_hash BLOB NOT NULL,
        node_position INTEGER NOT NULL,
        time INTEGER NOT NULL,
        tx_count INTEGER NOT NULL,
        data BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS block_chain_time ON block_chain (time, node_position);
    CREATE TABLE IF NOT EXISTS candidate_nodes (
        id INTEGER PRIMARY KEY,
        node_pub_key TEXT NOT NULL,
        tcp_address TEXT NOT NULL,
        reply_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS confirmations (
        block_id INTEGER PRIMARY KEY,
        good INTEGER NOT NULL,
        bad INTEGER NOT NULL,
        time INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS transactions_status (
        hash BLOB PRIMARY KEY,
        sent INTEGER NOT NULL DEFAULT 0,
        verified INTEGER NOT NULL DEFAULT 0,
        used INTEGER NOT NULL DEFAULT 0,
        block_id INTEGER
    );
    CREATE TABLE IF NOT EXISTS install (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        progress TEXT NOT NULL
    );
";

pub struct Database {
    conn: Mutex<Connection>,
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> ChainError {
    move |e| ChainError::DatabaseError(format!("{}: {}", context, e))
}

fn to_hash(bytes: Vec<u8>) -> rusqlite::Result<Hash> {
    Hash::try_from(bytes.as_slice()).map_err(|_| rusqlite::Error::InvalidQuery)
}

fn stored_block_from_row(row: &Row<'_>) -> rusqlite::Result<StoredBlock> {
    Ok(StoredBlock {
        id: row.get::<_, i64>(0)? as u64,
        hash: to_hash(row.get(1)?)?,
        rollbacks_hash: to_hash(row.get(2)?)?,
        node_position: row.get::<_, i64>(3)? as u64,
        time: row.get(4)?,
        tx_count: row.get::<_, i64>(5)? as u32,
        data: row.get(6)?,
    })
}

fn confirmation_from_row(row: &Row<'_>) -> rusqlite::Result<Confirmation> {
    Ok(Confirmation {
        block_id: row.get::<_, i64>(0)? as u64,
        good: row.get::<_, i64>(1)? as u32,
        bad: row.get::<_, i64>(2)? as u32,
        time: row.get(3)?,
    })
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionStatus> {
    Ok(TransactionStatus {
        hash: to_hash(row.get(0)?)?,
        sent: row.get(1)?,
        verified: row.get(2)?,
        used: row.get(3)?,
        block_id: row.get::<_, Option<i64>>(4)?.map(|id| id as u64),
    })
}

const BLOCK_COLUMNS: &str = "id, hash, rollbacks_hash, node_position, time, tx_count, data";

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("Failed to open database"))?;
        conn.execute_batch(SCHEMA)
            .map_err(db_err("Failed to create schema"))?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn update_status_flags(&self, sql: &str, hashes: &[Hash]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(db_err("Failed to start transaction"))?;
        {
            let mut stmt = tx.prepare(sql).map_err(db_err("Failed to prepare update"))?;
            for hash in hashes {
                stmt.execute(params![hash.to_vec()])
                    .map_err(db_err("Failed to update transaction status"))?;
            }
        }
        tx.commit().map_err(db_err("Failed to commit transaction"))?;
        Ok(())
    }
}

impl ChainStore for Database {
    fn info_block(&self) -> Result<Option<InfoBlock>> {
        let conn = self.conn.lock();
        let info = conn
            .query_row(
                "SELECT block_id, hash, rollbacks_hash, node_position, time FROM info_block WHERE id = 1",
                [],
                |row| {
                    Ok(InfoBlock {
                        block_id: row.get::<_, i64>(0)? as u64,
                        hash: to_hash(row.get(1)?)?,
                        rollbacks_hash: to_hash(row.get(2)?)?,
                        node_position: row.get::<_, i64>(3)? as u64,
                        time: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(db_err("Failed to load info block"))?;
        Ok(info)
    }

    fn set_info_block(&self, info: &InfoBlock) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO info_block (id, block_id, hash, rollbacks_hash, node_position, time)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                info.block_id as i64,
                info.hash.to_vec(),
                info.rollbacks_hash.to_vec(),
                info.node_position as i64,
                info.time,
            ],
        )
        .map_err(db_err("Failed to save info block"))?;
        Ok(())
    }

    fn block(&self, id: u64) -> Result<Option<StoredBlock>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM block_chain WHERE id = ?1", BLOCK_COLUMNS);
        let block = conn
            .query_row(&sql, params![id as i64], stored_block_from_row)
            .optional()
            .map_err(db_err("Failed to load block"))?;
        Ok(block)
    }

    fn insert_block(&self, block: &StoredBlock) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO block_chain (id, hash, rollbacks_hash, node_position, time, tx_count, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                block.id as i64,
                block.hash.to_vec(),
                block.rollbacks_hash.to_vec(),
                block.node_position as i64,
                block.time,
                block.tx_count as i64,
                block.data,
            ],
        )
        .map_err(db_err("Failed to save block"))?;
        Ok(())
    }

    fn delete_block(&self, id: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM block_chain WHERE id = ?1", params![id as i64])
            .map_err(db_err("Failed to delete block"))?;
        Ok(())
    }

    fn recent_blocks(&self, count: usize) -> Result<Vec<StoredBlock>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM block_chain ORDER BY id DESC LIMIT ?1",
            BLOCK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map(params![count as i64], stored_block_from_row)
            .map_err(db_err("Failed to query blocks"))?;
        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row.map_err(db_err("Failed to read block"))?);
        }
        Ok(blocks)
    }

    fn count_node_blocks_between(
        &self,
        start: i64,
        end: i64,
        node_position: u64,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM block_chain WHERE time >= ?1 AND time < ?2 AND node_position = ?3",
                params![start, end, node_position as i64],
                |row| row.get(0),
            )
            .map_err(db_err("Failed to count node blocks"))?;
        Ok(count as usize)
    }

    fn candidate_nodes(&self) -> Result<Vec<CandidateNode>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, node_pub_key, tcp_address, reply_count FROM candidate_nodes ORDER BY id")
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CandidateNode {
                    id: row.get::<_, i64>(0)? as u64,
                    node_pub_key: row.get(1)?,
                    tcp_address: row.get(2)?,
                    reply_count: row.get::<_, i64>(3)? as u64,
                })
            })
            .map_err(db_err("Failed to query candidate nodes"))?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row.map_err(db_err("Failed to read candidate node"))?);
        }
        Ok(nodes)
    }

    fn save_candidate_node(&self, node: &CandidateNode) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO candidate_nodes (id, node_pub_key, tcp_address, reply_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                node.id as i64,
                node.node_pub_key,
                node.tcp_address,
                node.reply_count as i64,
            ],
        )
        .map_err(db_err("Failed to save candidate node"))?;
        Ok(())
    }

    fn increment_reply_count(&self, id: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE candidate_nodes SET reply_count = reply_count + 1 WHERE id = ?1",
            params![id as i64],
        )
        .map_err(db_err("Failed to update reply count"))?;
        Ok(())
    }

    fn save_confirmation(&self, confirmation: &Confirmation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO confirmations (block_id, good, bad, time) VALUES (?1, ?2, ?3, ?4)",
            params![
                confirmation.block_id as i64,
                confirmation.good as i64,
                confirmation.bad as i64,
                confirmation.time,
            ],
        )
        .map_err(db_err("Failed to save confirmation"))?;
        Ok(())
    }

    fn confirmation(&self, block_id: u64) -> Result<Option<Confirmation>> {
        let conn = self.conn.lock();
        let confirmation = conn
            .query_row(
                "SELECT block_id, good, bad, time FROM confirmations WHERE block_id = ?1",
                params![block_id as i64],
                confirmation_from_row,
            )
            .optional()
            .map_err(db_err("Failed to load confirmation"))?;
        Ok(confirmation)
    }

    fn last_good_confirmation(&self, min_good: u32) -> Result<Option<Confirmation>> {
        let conn = self.conn.lock();
        let confirmation = conn
            .query_row(
                "SELECT block_id, good, bad, time FROM confirmations WHERE good >= ?1
                 ORDER BY block_id DESC LIMIT 1",
                params![min_good as i64],
                confirmation_from_row,
            )
            .optional()
            .map_err(db_err("Failed to load confirmation"))?;
        Ok(confirmation)
    }

    fn save_transaction_status(&self, status: &TransactionStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO transactions_status (hash, sent, verified, used, block_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                status.hash.to_vec(),
                status.sent,
                status.verified,
                status.used,
                status.block_id.map(|id| id as i64),
            ],
        )
        .map_err(db_err("Failed to save transaction status"))?;
        Ok(())
    }

    fn transaction_status(&self, hash: &Hash) -> Result<Option<TransactionStatus>> {
        let conn = self.conn.lock();
        let status = conn
            .query_row(
                "SELECT hash, sent, verified, used, block_id FROM transactions_status WHERE hash = ?1",
                params![hash.to_vec()],
                status_from_row,
            )
            .optional()
            .map_err(db_err("Failed to load transaction status"))?;
        Ok(status)
    }

    fn delete_transaction_status(&self, hash: &Hash) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM transactions_status WHERE hash = ?1",
            params![hash.to_vec()],
        )
        .map_err(db_err("Failed to delete transaction status"))?;
        Ok(())
    }

    fn verified_unused_transactions(&self) -> Result<Vec<TransactionStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT hash, sent, verified, used, block_id FROM transactions_status
                 WHERE verified = 1 AND used = 0",
            )
            .map_err(db_err("Failed to prepare status query"))?;
        let statuses = stmt
            .query_map([], status_from_row)
            .map_err(db_err("Failed to query transaction statuses"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Failed to read transaction status"))?;
        Ok(statuses)
    }

    fn mark_transactions_sent(&self, hashes: &[Hash]) -> Result<()> {
        self.update_status_flags(
            "INSERT INTO transactions_status (hash, sent) VALUES (?1, 1)
             ON CONFLICT(hash) DO UPDATE SET sent = 1",
            hashes,
        )
    }

    fn mark_transactions_used(&self, block_id: u64, hashes: &[Hash]) -> Result<()> {
        let sql = format!(
            "INSERT INTO transactions_status (hash, verified, used, block_id) VALUES (?1, 1, 1, {id})
             ON CONFLICT(hash) DO UPDATE SET verified = 1, used = 1, block_id = {id}",
            id = block_id as i64
        );
        self.update_status_flags(&sql, hashes)
    }

    fn mark_transactions_unverified(&self, hashes: &[Hash]) -> Result<()> {
        self.update_status_flags(
            "UPDATE transactions_status SET verified = 0, used = 0, block_id = NULL WHERE hash = ?1",
            hashes,
        )
    }

    fn mark_verified_unused_unverified(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE transactions_status SET verified = 0 WHERE verified = 1 AND used = 0",
            [],
        )
        .map_err(db_err("Failed to reset verified transactions"))?;
        Ok(())
    }

    fn is_installed(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let progress: Option<String> = conn
            .query_row("SELECT progress FROM install WHERE id = 1", [], |row| row.get(0))
            .optional()
            .map_err(db_err("Failed to read install marker"))?;
        Ok(progress.as_deref() == Some("complete"))
    }

    fn set_installed(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO install (id, progress) VALUES (1, 'complete')",
            [],
        )
        .map_err(db_err("Failed to write install marker"))?;
        Ok(())
    }
}
