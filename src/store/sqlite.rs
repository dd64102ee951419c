//! SQLite store.
//!
//! WAL mode so readers never wait on the writer. Every transaction opens
//! with `BEGIN IMMEDIATE`, taking the write lock up front: two processes
//! sharing one database file serialize on it, and the partial unique index
//! on active claims rejects a second lease even if application checks race.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};

use super::{StoreTx, TicketStore};
use crate::activity::{ActivityEntry, Actor, NewActivity};
use crate::error::{Error, Result};
use crate::model::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TICKET_COLUMNS: &str = "id, title, description, status, priority, retry_count, \
     max_retries, parent, resolution, human_flag_reason, flagged_from, created_at, \
     updated_at, completed_at";

const CLAIM_COLUMNS: &str =
    "id, ticket_id, worker_id, claimed_at, expires_at, status, ended_at, reason";

/// Storage backend. Owns the SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Handle for storage operations within one `BEGIN IMMEDIATE` transaction.
struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL mode for concurrent readers
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sequences (
                project     TEXT PRIMARY KEY,
                last        INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tickets (
                id                  TEXT PRIMARY KEY,
                project             TEXT NOT NULL,
                number              INTEGER NOT NULL,
                title               TEXT NOT NULL,
                description         TEXT NOT NULL DEFAULT '',
                status              TEXT NOT NULL,
                priority            INTEGER NOT NULL,
                retry_count         INTEGER NOT NULL DEFAULT 0,
                max_retries         INTEGER NOT NULL,
                parent              TEXT REFERENCES tickets(id),
                resolution          TEXT,
                human_flag_reason   TEXT,
                flagged_from        TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                completed_at        TEXT,
                UNIQUE (project, number)
            );

            CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
            CREATE INDEX IF NOT EXISTS idx_tickets_parent ON tickets(parent)
                WHERE parent IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_tickets_queue ON tickets(priority ASC, created_at ASC)
                WHERE status = 'ready';

            CREATE TABLE IF NOT EXISTS claims (
                id          TEXT PRIMARY KEY,
                ticket_id   TEXT NOT NULL REFERENCES tickets(id),
                worker_id   TEXT NOT NULL,
                claimed_at  TEXT NOT NULL,
                expires_at  TEXT NOT NULL,
                status      TEXT NOT NULL,
                ended_at    TEXT,
                reason      TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_one_active ON claims(ticket_id)
                WHERE status = 'active';
            CREATE INDEX IF NOT EXISTS idx_claims_expiry ON claims(expires_at)
                WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS dependencies (
                dependent       TEXT NOT NULL REFERENCES tickets(id),
                prerequisite    TEXT NOT NULL REFERENCES tickets(id),
                created_at      TEXT NOT NULL,
                PRIMARY KEY (dependent, prerequisite)
            );

            CREATE INDEX IF NOT EXISTS idx_deps_prerequisite ON dependencies(prerequisite);

            CREATE TABLE IF NOT EXISTS activity (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id   TEXT NOT NULL,
                action      TEXT NOT NULL,
                actor_kind  TEXT NOT NULL,
                actor_name  TEXT,
                details     TEXT,
                timestamp   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_activity_ticket ON activity(ticket_id, seq);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("sqlite connection lock poisoned".into()))
    }
}

impl TicketStore for SqliteStore {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = {
            let mut ctx = SqliteTx { conn: &*tx };
            f(&mut ctx)?
        };
        tx.commit()?;
        Ok(result)
    }

    fn append_activity(&self, entry: NewActivity) -> Result<ActivityEntry> {
        let conn = self.lock()?;
        let details = entry
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Internal(format!("unserializable activity details: {e}")))?;
        conn.execute(
            "INSERT INTO activity (ticket_id, action, actor_kind, actor_name, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.ticket_id.to_string(),
                entry.action.as_str(),
                entry.actor.kind(),
                entry.actor.name(),
                details,
                ts(entry.timestamp),
            ],
        )?;
        let seq = conn.last_insert_rowid() as u64;
        Ok(entry.into_entry(seq))
    }

    fn activity_for(&self, ticket: &TicketId) -> Result<Vec<ActivityEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, ticket_id, action, actor_kind, actor_name, details, timestamp
             FROM activity WHERE ticket_id = ?1 ORDER BY seq ASC",
        )?;

        let rows = stmt
            .query_map(params![ticket.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, ticket_id, action, kind, name, details, timestamp)| {
                Ok(ActivityEntry {
                    seq: seq as u64,
                    ticket_id: ticket_id.parse()?,
                    action: action.parse()?,
                    actor: Actor::from_parts(&kind, name)?,
                    details: details
                        .map(|d| serde_json::from_str(&d))
                        .transpose()
                        .map_err(|e| Error::Internal(format!("corrupt activity details: {e}")))?,
                    timestamp: parse_ts(&timestamp)?,
                })
            })
            .collect()
    }
}

impl StoreTx for SqliteTx<'_> {
    fn next_ticket_number(&mut self, project: &str) -> Result<u32> {
        let last: u32 = self.conn.query_row(
            "INSERT INTO sequences (project, last) VALUES (?1, 1)
             ON CONFLICT (project) DO UPDATE SET last = last + 1
             RETURNING last",
            params![project],
            |row| row.get(0),
        )?;
        Ok(last)
    }

    fn insert_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tickets (
                    id, project, number, title, description, status, priority,
                    retry_count, max_retries, parent, resolution, human_flag_reason,
                    flagged_from, created_at, updated_at, completed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    ticket.id.to_string(),
                    ticket.id.project,
                    ticket.id.number,
                    ticket.title,
                    ticket.description,
                    ticket.status.as_str(),
                    ticket.priority.rank(),
                    ticket.retry_count,
                    ticket.max_retries,
                    ticket.parent.as_ref().map(ToString::to_string),
                    ticket.resolution.map(|r| r.to_string()),
                    ticket.human_flag_reason,
                    ticket.flagged_from.map(Status::as_str),
                    ts(ticket.created_at),
                    ts(ticket.updated_at),
                    ticket.completed_at.map(ts),
                ],
            )
            .map_err(|e| conflict_on_constraint(e, format!("ticket {} already exists", ticket.id)))?;
        Ok(())
    }

    fn get_ticket(&mut self, id: &TicketId) -> Result<Ticket> {
        self.conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id.to_string()],
                TicketRow::from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("ticket {id}")))?
            .into_ticket()
    }

    fn update_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE tickets SET
                title = ?1, description = ?2, status = ?3, priority = ?4,
                retry_count = ?5, max_retries = ?6, parent = ?7, resolution = ?8,
                human_flag_reason = ?9, flagged_from = ?10, updated_at = ?11,
                completed_at = ?12
             WHERE id = ?13",
            params![
                ticket.title,
                ticket.description,
                ticket.status.as_str(),
                ticket.priority.rank(),
                ticket.retry_count,
                ticket.max_retries,
                ticket.parent.as_ref().map(ToString::to_string),
                ticket.resolution.map(|r| r.to_string()),
                ticket.human_flag_reason,
                ticket.flagged_from.map(Status::as_str),
                ts(ticket.updated_at),
                ticket.completed_at.map(ts),
                ticket.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("ticket {}", ticket.id)));
        }
        Ok(())
    }

    fn list_tickets(&mut self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(ref project) = filter.project {
            values.push(Value::Text(project.clone()));
            clauses.push(format!("project = ?{}", values.len()));
        }
        if !filter.statuses.is_empty() {
            let mut slots = Vec::new();
            for status in &filter.statuses {
                values.push(Value::Text(status.as_str().to_string()));
                slots.push(format!("?{}", values.len()));
            }
            clauses.push(format!("status IN ({})", slots.join(", ")));
        }
        if let Some(ref parent) = filter.parent {
            values.push(Value::Text(parent.to_string()));
            clauses.push(format!("parent = ?{}", values.len()));
        }
        if let Some(priority) = filter.priority {
            values.push(Value::Integer(priority.rank()));
            clauses.push(format!("priority = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {TICKET_COLUMNS} FROM tickets");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY priority ASC, created_at ASC, project ASC, number ASC");
        if let Some(limit) = filter.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), TicketRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(TicketRow::into_ticket).collect()
    }

    fn insert_claim(&mut self, claim: &Claim) -> Result<()> {
        self.conn
            .execute(
                &format!("INSERT INTO claims ({CLAIM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    claim.id.0.to_string(),
                    claim.ticket_id.to_string(),
                    claim.worker_id,
                    ts(claim.claimed_at),
                    ts(claim.expires_at),
                    claim.status.as_str(),
                    claim.ended_at.map(ts),
                    claim.reason,
                ],
            )
            .map_err(|e| {
                conflict_on_constraint(
                    e,
                    format!("ticket {} already has an active claim", claim.ticket_id),
                )
            })?;
        Ok(())
    }

    fn get_claim(&mut self, id: ClaimId) -> Result<Claim> {
        self.conn
            .query_row(
                &format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE id = ?1"),
                params![id.0.to_string()],
                ClaimRow::from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("claim {id}")))?
            .into_claim()
    }

    fn active_claim(&mut self, ticket: &TicketId) -> Result<Option<Claim>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {CLAIM_COLUMNS} FROM claims WHERE ticket_id = ?1 AND status = 'active'"
                ),
                params![ticket.to_string()],
                ClaimRow::from_row,
            )
            .optional()?
            .map(ClaimRow::into_claim)
            .transpose()
    }

    fn update_claim(&mut self, claim: &Claim) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE claims SET expires_at = ?1, status = ?2, ended_at = ?3, reason = ?4
             WHERE id = ?5",
            params![
                ts(claim.expires_at),
                claim.status.as_str(),
                claim.ended_at.map(ts),
                claim.reason,
                claim.id.0.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("claim {}", claim.id)));
        }
        Ok(())
    }

    fn expired_claims(&mut self, now: DateTime<Utc>) -> Result<Vec<Claim>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims
             WHERE status = 'active' AND expires_at < ?1
             ORDER BY expires_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![ts(now)], ClaimRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(ClaimRow::into_claim).collect()
    }

    fn insert_dependency(&mut self, dep: &Dependency) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO dependencies (dependent, prerequisite, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (dependent, prerequisite) DO NOTHING",
            params![
                dep.dependent.to_string(),
                dep.prerequisite.to_string(),
                ts(dep.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn delete_dependency(
        &mut self,
        dependent: &TicketId,
        prerequisite: &TicketId,
    ) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM dependencies WHERE dependent = ?1 AND prerequisite = ?2",
            params![dependent.to_string(), prerequisite.to_string()],
        )?;
        Ok(deleted > 0)
    }

    fn prerequisites_of(&mut self, id: &TicketId) -> Result<Vec<TicketId>> {
        ids_on(
            self.conn,
            "SELECT prerequisite FROM dependencies WHERE dependent = ?1 ORDER BY prerequisite",
            id,
        )
    }

    fn dependents_of(&mut self, id: &TicketId) -> Result<Vec<TicketId>> {
        ids_on(
            self.conn,
            "SELECT dependent FROM dependencies WHERE prerequisite = ?1 ORDER BY dependent",
            id,
        )
    }
}

// ---------------------------------------------------------------------------
// Inner helpers
// ---------------------------------------------------------------------------

fn ids_on(conn: &Connection, sql: &str, id: &TicketId) -> Result<Vec<TicketId>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params![id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.iter().map(|s| s.parse()).collect()
}

fn conflict_on_constraint(e: rusqlite::Error, message: String) -> Error {
    if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        Error::Conflict(message)
    } else {
        Error::Storage(e)
    }
}

/// Fixed-width UTC text, so string order is time order inside SQL.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("corrupt timestamp {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

struct TicketRow {
    id: String,
    title: String,
    description: String,
    status: String,
    priority: i64,
    retry_count: u32,
    max_retries: u32,
    parent: Option<String>,
    resolution: Option<String>,
    human_flag_reason: Option<String>,
    flagged_from: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TicketRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            retry_count: row.get(5)?,
            max_retries: row.get(6)?,
            parent: row.get(7)?,
            resolution: row.get(8)?,
            human_flag_reason: row.get(9)?,
            flagged_from: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }

    fn into_ticket(self) -> Result<Ticket> {
        Ok(Ticket {
            id: self.id.parse()?,
            title: self.title,
            description: self.description,
            status: self.status.parse()?,
            priority: Priority::from_rank(self.priority)?,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            parent: self.parent.map(|p| p.parse()).transpose()?,
            resolution: self.resolution.map(|r| r.parse()).transpose()?,
            human_flag_reason: self.human_flag_reason,
            flagged_from: self.flagged_from.map(|s| s.parse()).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct ClaimRow {
    id: String,
    ticket_id: String,
    worker_id: String,
    claimed_at: String,
    expires_at: String,
    status: String,
    ended_at: Option<String>,
    reason: Option<String>,
}

impl ClaimRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ticket_id: row.get(1)?,
            worker_id: row.get(2)?,
            claimed_at: row.get(3)?,
            expires_at: row.get(4)?,
            status: row.get(5)?,
            ended_at: row.get(6)?,
            reason: row.get(7)?,
        })
    }

    fn into_claim(self) -> Result<Claim> {
        Ok(Claim {
            id: ClaimId(
                self.id
                    .parse()
                    .map_err(|e: uuid::Error| Error::Internal(format!("corrupt claim id: {e}")))?,
            ),
            ticket_id: self.ticket_id.parse()?,
            worker_id: self.worker_id,
            claimed_at: parse_ts(&self.claimed_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            status: self.status.parse()?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            reason: self.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Action;

    fn ticket(number: u32, priority: Priority) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: TicketId::new("SQL", number),
            title: format!("ticket {number}"),
            description: String::new(),
            status: Status::Ready,
            priority,
            retry_count: 0,
            max_retries: 3,
            parent: None,
            resolution: None,
            human_flag_reason: None,
            flagged_from: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn claim_on(ticket: &TicketId) -> Claim {
        let now = Utc::now();
        Claim {
            id: ClaimId::new(),
            ticket_id: ticket.clone(),
            worker_id: "worker-1".into(),
            claimed_at: now,
            expires_at: now + chrono::Duration::minutes(10),
            status: ClaimStatus::Active,
            ended_at: None,
            reason: None,
        }
    }

    #[test]
    fn ticket_survives_a_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut t = ticket(1, Priority::High);
        t.human_flag_reason = Some("why".into());
        t.flagged_from = Some(Status::InProgress);
        store.transaction(|tx| tx.insert_ticket(&t)).unwrap();

        let loaded = store.transaction(|tx| tx.get_ticket(&t.id)).unwrap();
        assert_eq!(loaded.id, t.id);
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.flagged_from, Some(Status::InProgress));
        assert_eq!(loaded.human_flag_reason.as_deref(), Some("why"));
    }

    #[test]
    fn unique_index_rejects_second_active_claim() {
        let store = SqliteStore::in_memory().unwrap();
        let t = ticket(1, Priority::Medium);
        store
            .transaction(|tx| {
                tx.insert_ticket(&t)?;
                tx.insert_claim(&claim_on(&t.id))
            })
            .unwrap();

        let second = store.transaction(|tx| tx.insert_claim(&claim_on(&t.id)));
        assert!(matches!(second, Err(Error::Conflict(_))), "{second:?}");

        // A non-active claim is not constrained.
        let mut ended = claim_on(&t.id);
        ended.status = ClaimStatus::Released;
        store.transaction(|tx| tx.insert_claim(&ended)).unwrap();
    }

    #[test]
    fn list_orders_by_priority_then_age_and_filters() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.insert_ticket(&ticket(1, Priority::Low))?;
                tx.insert_ticket(&ticket(2, Priority::Highest))?;
                let mut blocked = ticket(3, Priority::Highest);
                blocked.status = Status::Blocked;
                tx.insert_ticket(&blocked)
            })
            .unwrap();

        let ready = store
            .transaction(|tx| tx.list_tickets(&TicketFilter::default().status(Status::Ready)))
            .unwrap();
        let ids: Vec<u32> = ready.iter().map(|t| t.id.number).collect();
        assert_eq!(ids, vec![2, 1]);

        let limited = store
            .transaction(|tx| tx.list_tickets(&TicketFilter::default().limit(1)))
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn expired_claims_compare_by_time() {
        let store = SqliteStore::in_memory().unwrap();
        let t = ticket(1, Priority::Medium);
        let mut claim = claim_on(&t.id);
        claim.expires_at = Utc::now() - chrono::Duration::hours(1);
        store
            .transaction(|tx| {
                tx.insert_ticket(&t)?;
                tx.insert_claim(&claim)
            })
            .unwrap();

        let expired = store
            .transaction(|tx| tx.expired_claims(Utc::now()))
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, claim.id);

        let none = store
            .transaction(|tx| tx.expired_claims(claim.expires_at))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn activity_keeps_sequence_and_details() {
        let store = SqliteStore::in_memory().unwrap();
        let id = TicketId::new("SQL", 9);
        store
            .append_activity(NewActivity::new(
                id.clone(),
                Action::Claimed,
                Actor::agent("bot"),
                Utc::now(),
            ))
            .unwrap();
        store
            .append_activity(
                NewActivity::new(id.clone(), Action::Expired, Actor::System, Utc::now())
                    .details(serde_json::json!({"retry_count": 1})),
            )
            .unwrap();

        let log = store.activity_for(&id).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[1].seq > log[0].seq);
        assert_eq!(log[0].actor, Actor::agent("bot"));
        assert_eq!(log[1].details, Some(serde_json::json!({"retry_count": 1})));
    }
}
