use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sled::transaction::TransactionError;
use sled::{Transactional, Tree};
use tracing::info;

use crate::account::Account;
use crate::error::{PoolError, PoolResult};
use crate::payment::Payment;
use crate::share::Share;

/// Current schema version of the pool database.
pub const DB_VERSION: u32 = 1;

// Tree names. The children of the pool bucket are sibling trees; the
// pool tree itself holds only the scalar checkpoints.
const POOL_BKT: &str = "poolbkt";
const ACCOUNT_BKT: &str = "accountbkt";
const SHARE_BKT: &str = "sharebkt";
const JOB_BKT: &str = "jobbkt";
const WORK_BKT: &str = "workbkt";
const PAYMENT_BKT: &str = "paymentbkt";
const PAYMENT_ARCHIVE_BKT: &str = "paymentarchivebkt";

const CHILD_BKTS: [&str; 6] = [
    ACCOUNT_BKT,
    SHARE_BKT,
    JOB_BKT,
    WORK_BKT,
    PAYMENT_BKT,
    PAYMENT_ARCHIVE_BKT,
];

// Scalar keys within the pool tree.
const VERSION_K: &[u8] = b"version";
const SOLO_POOL_K: &[u8] = b"solopool";
const CSRF_SECRET_K: &[u8] = b"csrfsecret";
const LAST_PAYMENT_HEIGHT_K: &[u8] = b"lastpaymentheight";
const LAST_PAYMENT_PAID_ON_K: &[u8] = b"lastpaymentpaidon";
const LAST_PAYMENT_CREATED_ON_K: &[u8] = b"lastpaymentcreatedon";

/// Database backup directory name, created as a sibling of the database
/// when the pool mode changes.
const BACKUP_FILE: &str = "backup.kv";

fn nano_to_big_endian(nano: i64) -> [u8; 8] {
    (nano as u64).to_be_bytes()
}

fn big_endian_to_nano(bytes: &[u8]) -> PoolResult<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| PoolError::ValueNotFound("malformed nanosecond scalar".into()))?;
    Ok(u64::from_be_bytes(arr) as i64)
}

fn little_endian_to_u32(bytes: &[u8]) -> PoolResult<u32> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| PoolError::ValueNotFound("malformed u32 scalar".into()))?;
    Ok(u32::from_le_bytes(arr))
}

/// Bucketed persistence for accounts, shares, payments and the scalar
/// payment checkpoints.
///
/// All values handed back to callers are copied out of the underlying
/// tree before the call returns, so they stay valid independently of any
/// storage transaction.
pub struct PoolStore {
    db: sled::Db,
    pool: Tree,
    accounts: Tree,
    shares: Tree,
    payments: Tree,
    archive: Tree,
}

impl PoolStore {
    /// Opens (creating if necessary) the pool database at the provided
    /// path. If the stored pool mode disagrees with `solo_pool`, the
    /// database is backed up to a `backup.kv` sibling and wiped before
    /// use.
    pub fn open(path: impl AsRef<Path>, solo_pool: bool) -> PoolResult<Self> {
        let path = path.as_ref();
        let db = sled::Config::new()
            .path(path)
            .open()
            .map_err(|err| PoolError::DbOpen(format!("unable to open db at {path:?}: {err}")))?;

        let pool = open_tree(&db, POOL_BKT)?;
        if pool
            .get(VERSION_K)
            .map_err(|err| PoolError::DbOpen(format!("unable to read db version: {err}")))?
            .is_none()
        {
            pool.insert(VERSION_K, &DB_VERSION.to_le_bytes()[..])
                .map_err(|err| {
                    PoolError::PersistEntry(format!("unable to persist db version: {err}"))
                })?;
        }
        upgrade_db(&pool)?;

        let stored_mode = pool
            .get(SOLO_POOL_K)
            .map_err(|err| PoolError::DbOpen(format!("unable to read pool mode: {err}")))?
            .map(|value| little_endian_to_u32(&value))
            .transpose()?;
        if let Some(mode) = stored_mode {
            if (mode == 1) != solo_pool {
                backup(&db, path)?;
                info!("pool mode changed, database backup created");
                purge(&db, &pool)?;
                info!("database wiped");
            }
        }

        let store = Self {
            accounts: open_tree(&db, ACCOUNT_BKT)?,
            shares: open_tree(&db, SHARE_BKT)?,
            payments: open_tree(&db, PAYMENT_BKT)?,
            archive: open_tree(&db, PAYMENT_ARCHIVE_BKT)?,
            pool,
            db,
        };
        // Job and work trees are owned by the chain-facing subsystems but
        // created here so a fresh database carries the full layout.
        open_tree(&store.db, JOB_BKT)?;
        open_tree(&store.db, WORK_BKT)?;

        store.persist_pool_mode(u32::from(solo_pool))?;
        Ok(store)
    }

    pub fn flush(&self) -> PoolResult<()> {
        self.db
            .flush()
            .map_err(|err| PoolError::PersistEntry(format!("unable to flush db: {err}")))?;
        Ok(())
    }

    // ---- accounts ----

    pub fn persist_account(&self, account: &Account) -> PoolResult<()> {
        let key = account.uuid.as_bytes();
        let exists = self.accounts.contains_key(key).map_err(|err| {
            PoolError::PersistEntry(format!("unable to check account existence: {err}"))
        })?;
        if exists {
            return Err(PoolError::PersistEntry(format!(
                "account {} already exists",
                account.uuid
            )));
        }
        let value = bincode::serialize(account)?;
        self.accounts.insert(key, value).map_err(|err| {
            PoolError::PersistEntry(format!("unable to persist account {}: {err}", account.uuid))
        })?;
        Ok(())
    }

    pub fn fetch_account(&self, id: &str) -> PoolResult<Account> {
        let value = self
            .accounts
            .get(id.as_bytes())
            .map_err(|err| PoolError::PersistEntry(format!("unable to fetch account: {err}")))?
            .ok_or_else(|| PoolError::ValueNotFound(format!("no account found for {id}")))?;
        Ok(bincode::deserialize(&value)?)
    }

    // ---- shares ----

    pub fn persist_share(&self, share: &Share) -> PoolResult<()> {
        let value = bincode::serialize(share)?;
        self.shares.insert(share.key(), value).map_err(|err| {
            PoolError::PersistEntry(format!(
                "unable to persist share for {}: {err}",
                share.account
            ))
        })?;
        Ok(())
    }

    /// Fetches all shares created at or before the provided work
    /// creation time, for the PPS scheme.
    pub fn pps_eligible_shares(&self, work_created_on: i64) -> PoolResult<Vec<Share>> {
        let upper = nano_to_big_endian(work_created_on.saturating_add(1));
        self.collect_shares(self.shares.range(..upper))
    }

    /// Fetches all shares created at or after the provided minimum time,
    /// for the PPLNS scheme.
    pub fn pplns_eligible_shares(&self, min_created_on: i64) -> PoolResult<Vec<Share>> {
        let lower = nano_to_big_endian(min_created_on);
        self.collect_shares(self.shares.range(lower..))
    }

    fn collect_shares(&self, iter: sled::Iter) -> PoolResult<Vec<Share>> {
        let mut shares = Vec::new();
        for entry in iter {
            let (_, value) = entry
                .map_err(|err| PoolError::PersistEntry(format!("unable to read share: {err}")))?;
            shares.push(bincode::deserialize(&value)?);
        }
        Ok(shares)
    }

    /// Deletes every share created at or before the provided boundary.
    pub fn prune_shares(&self, boundary: i64) -> PoolResult<()> {
        let upper = nano_to_big_endian(boundary.saturating_add(1));
        let stale: Vec<sled::IVec> = self
            .shares
            .range(..upper)
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|err| PoolError::DeleteEntry(format!("unable to scan shares: {err}")))?;
        for key in stale {
            self.shares.remove(&key).map_err(|err| {
                PoolError::DeleteEntry(format!("unable to prune share: {err}"))
            })?;
        }
        Ok(())
    }

    // ---- payments ----

    pub fn persist_payment(&self, payment: &Payment) -> PoolResult<()> {
        let value = bincode::serialize(payment)?;
        self.payments.insert(payment.key(), value).map_err(|err| {
            PoolError::PersistEntry(format!(
                "unable to persist payment for {}: {err}",
                payment.account
            ))
        })?;
        Ok(())
    }

    pub fn update_payment(&self, payment: &Payment) -> PoolResult<()> {
        self.persist_payment(payment)
    }

    /// Moves the payment from the live bucket to the archive bucket in a
    /// single write transaction.
    pub fn archive_payment(&self, payment: &Payment) -> PoolResult<()> {
        let key = payment.key();
        let value = bincode::serialize(payment)?;
        let result: Result<(), TransactionError<PoolError>> = (&self.payments, &self.archive)
            .transaction(|(live, archive)| {
                live.remove(key.as_slice())?;
                archive.insert(key.as_slice(), value.as_slice())?;
                Ok(())
            });
        result.map_err(|err| match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => PoolError::Storage(err),
        })
    }

    /// Fetches all live payments with an estimated maturity at or below
    /// the provided height, grouped by the hex-encoded source block hash.
    pub fn mature_pending_payments(
        &self,
        height: u32,
    ) -> PoolResult<HashMap<String, Vec<Payment>>> {
        let mut grouped: HashMap<String, Vec<Payment>> = HashMap::new();
        for entry in self.payments.iter() {
            let (_, value) = entry
                .map_err(|err| PoolError::PersistEntry(format!("unable to read payment: {err}")))?;
            let payment: Payment = bincode::deserialize(&value)?;
            if payment.paid_on_height == 0 && payment.estimated_maturity <= height {
                grouped
                    .entry(payment.source.block_hash.clone())
                    .or_default()
                    .push(payment);
            }
        }
        Ok(grouped)
    }

    /// Fetches all archived payments, in key order.
    pub fn archived_payments(&self) -> PoolResult<Vec<Payment>> {
        let mut payments = Vec::new();
        for entry in self.archive.iter() {
            let (_, value) = entry.map_err(|err| {
                PoolError::PersistEntry(format!("unable to read archived payment: {err}"))
            })?;
            payments.push(bincode::deserialize(&value)?);
        }
        Ok(payments)
    }

    // ---- scalar checkpoints ----

    pub fn persist_last_payment_info(&self, height: u32, paid_on: i64) -> PoolResult<()> {
        self.pool
            .insert(LAST_PAYMENT_HEIGHT_K, &height.to_le_bytes()[..])
            .map_err(|err| {
                PoolError::PersistEntry(format!("unable to persist last payment height: {err}"))
            })?;
        self.pool
            .insert(LAST_PAYMENT_PAID_ON_K, &nano_to_big_endian(paid_on)[..])
            .map_err(|err| {
                PoolError::PersistEntry(format!(
                    "unable to persist last payment paid-on time: {err}"
                ))
            })?;
        Ok(())
    }

    pub fn load_last_payment_info(&self) -> PoolResult<(u32, i64)> {
        let height = self.pool.get(LAST_PAYMENT_HEIGHT_K).map_err(|err| {
            PoolError::PersistEntry(format!("unable to load last payment height: {err}"))
        })?;
        let paid_on = self.pool.get(LAST_PAYMENT_PAID_ON_K).map_err(|err| {
            PoolError::PersistEntry(format!("unable to load last payment paid-on time: {err}"))
        })?;
        let (Some(height), Some(paid_on)) = (height, paid_on) else {
            return Err(PoolError::ValueNotFound(
                "last payment info not initialized".into(),
            ));
        };
        Ok((little_endian_to_u32(&height)?, big_endian_to_nano(&paid_on)?))
    }

    pub fn persist_last_payment_created_on(&self, created_on: i64) -> PoolResult<()> {
        self.pool
            .insert(LAST_PAYMENT_CREATED_ON_K, &nano_to_big_endian(created_on)[..])
            .map_err(|err| {
                PoolError::PersistEntry(format!(
                    "unable to persist last payment created-on time: {err}"
                ))
            })?;
        Ok(())
    }

    pub fn load_last_payment_created_on(&self) -> PoolResult<i64> {
        let value = self
            .pool
            .get(LAST_PAYMENT_CREATED_ON_K)
            .map_err(|err| {
                PoolError::PersistEntry(format!(
                    "unable to load last payment created-on time: {err}"
                ))
            })?
            .ok_or_else(|| {
                PoolError::ValueNotFound("last payment created-on not initialized".into())
            })?;
        big_endian_to_nano(&value)
    }

    pub fn persist_pool_mode(&self, mode: u32) -> PoolResult<()> {
        self.pool
            .insert(SOLO_POOL_K, &mode.to_le_bytes()[..])
            .map_err(|err| {
                PoolError::PersistEntry(format!("unable to persist pool mode: {err}"))
            })?;
        Ok(())
    }

    pub fn fetch_csrf_secret(&self) -> PoolResult<Vec<u8>> {
        let value = self
            .pool
            .get(CSRF_SECRET_K)
            .map_err(|err| {
                PoolError::PersistEntry(format!("unable to fetch csrf secret: {err}"))
            })?
            .ok_or_else(|| PoolError::ValueNotFound("no csrf secret found".into()))?;
        Ok(value.to_vec())
    }

    pub fn persist_csrf_secret(&self, secret: &[u8]) -> PoolResult<()> {
        self.pool.insert(CSRF_SECRET_K, secret).map_err(|err| {
            PoolError::PersistEntry(format!("unable to persist csrf secret: {err}"))
        })?;
        Ok(())
    }

    #[cfg(test)]
    fn raw_scalar(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.pool.get(key).unwrap().map(|value| value.to_vec())
    }
}

fn open_tree(db: &sled::Db, name: &str) -> PoolResult<Tree> {
    db.open_tree(name)
        .map_err(|err| PoolError::BucketCreate(format!("unable to create {name} bucket: {err}")))
}

/// Runs schema migrations after bucket creation. Initialization aborts if
/// the stored version is newer than this build supports.
fn upgrade_db(pool: &Tree) -> PoolResult<()> {
    let stored = pool
        .get(VERSION_K)
        .map_err(|err| PoolError::DbOpen(format!("unable to read db version: {err}")))?
        .map(|value| little_endian_to_u32(&value))
        .transpose()?
        .unwrap_or(DB_VERSION);
    if stored > DB_VERSION {
        return Err(PoolError::DbOpen(format!(
            "database version {stored} is newer than the supported version {DB_VERSION}"
        )));
    }
    // Versions below DB_VERSION would migrate here, then bump the stored
    // version. Version 1 is the first schema.
    if stored < DB_VERSION {
        pool.insert(VERSION_K, &DB_VERSION.to_le_bytes()[..])
            .map_err(|err| {
                PoolError::PersistEntry(format!("unable to persist db version: {err}"))
            })?;
    }
    Ok(())
}

/// Copies the database into a `backup.kv` sibling. The copy is flushed to
/// stable storage before this returns, so a wipe that follows cannot
/// destroy the only copy of the data.
fn backup(db: &sled::Db, path: &Path) -> PoolResult<()> {
    let backup_path: PathBuf = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(BACKUP_FILE);
    let backup_db = sled::Config::new()
        .path(&backup_path)
        .open()
        .map_err(|err| PoolError::Backup(format!("unable to open backup db: {err}")))?;
    backup_db.import(db.export());
    backup_db
        .flush()
        .map_err(|err| PoolError::Backup(format!("unable to flush backup db: {err}")))?;
    Ok(())
}

/// Removes every child bucket and every scalar except the database
/// version.
fn purge(db: &sled::Db, pool: &Tree) -> PoolResult<()> {
    for name in CHILD_BKTS {
        db.drop_tree(name).map_err(|err| {
            PoolError::DeleteEntry(format!("unable to drop {name} bucket: {err}"))
        })?;
    }
    for key in [
        LAST_PAYMENT_HEIGHT_K,
        LAST_PAYMENT_PAID_ON_K,
        LAST_PAYMENT_CREATED_ON_K,
        SOLO_POOL_K,
        CSRF_SECRET_K,
    ] {
        pool.remove(key).map_err(|err| {
            PoolError::DeleteEntry(format!("unable to delete scalar: {err}"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use num_rational::BigRational;
    use num_traits::FromPrimitive;

    use super::*;
    use crate::payment::PaymentSource;

    fn temp_store(solo: bool) -> (tempfile::TempDir, PoolStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PoolStore::open(dir.path().join("pool.kv"), solo).expect("open store");
        (dir, store)
    }

    fn source(block_tag: u8) -> PaymentSource {
        PaymentSource {
            block_hash: hex::encode([block_tag; 32]),
            coinbase: hex::encode([block_tag + 1; 32]),
        }
    }

    #[test]
    fn last_payment_info_endianness() {
        let (_dir, store) = temp_store(false);
        store
            .persist_last_payment_info(0x0102_0304, 0x0102_0304_0506_0708)
            .unwrap();
        assert_eq!(
            store.raw_scalar(LAST_PAYMENT_HEIGHT_K).unwrap(),
            vec![0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(
            store.raw_scalar(LAST_PAYMENT_PAID_ON_K).unwrap(),
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        let (height, paid_on) = store.load_last_payment_info().unwrap();
        assert_eq!(height, 0x0102_0304);
        assert_eq!(paid_on, 0x0102_0304_0506_0708);
    }

    #[test]
    fn created_on_round_trip() {
        let (_dir, store) = temp_store(false);
        assert!(matches!(
            store.load_last_payment_created_on(),
            Err(PoolError::ValueNotFound(_))
        ));
        store.persist_last_payment_created_on(42).unwrap();
        assert_eq!(store.load_last_payment_created_on().unwrap(), 42);
    }

    #[test]
    fn csrf_secret_round_trip() {
        let (_dir, store) = temp_store(false);
        assert!(matches!(
            store.fetch_csrf_secret(),
            Err(PoolError::ValueNotFound(_))
        ));
        store.persist_csrf_secret(b"secret").unwrap();
        assert_eq!(store.fetch_csrf_secret().unwrap(), b"secret".to_vec());
    }

    #[test]
    fn account_round_trip() {
        let (_dir, store) = temp_store(false);
        let account = Account::new("shgm1qqqq".into());
        store.persist_account(&account).unwrap();
        assert!(store.persist_account(&account).is_err());
        let fetched = store.fetch_account(&account.uuid).unwrap();
        assert_eq!(fetched, account);
        assert!(matches!(
            store.fetch_account("missing"),
            Err(PoolError::ValueNotFound(_))
        ));
    }

    #[test]
    fn share_eligibility_windows() {
        let (_dir, store) = temp_store(false);
        let weight = BigRational::from_u64(1).unwrap();
        for created_on in [10, 20, 30] {
            store
                .persist_share(&Share::new("acct".into(), weight.clone(), created_on))
                .unwrap();
        }

        let pps = store.pps_eligible_shares(20).unwrap();
        assert_eq!(
            pps.iter().map(|s| s.created_on).collect::<Vec<_>>(),
            vec![10, 20]
        );

        let pplns = store.pplns_eligible_shares(20).unwrap();
        assert_eq!(
            pplns.iter().map(|s| s.created_on).collect::<Vec<_>>(),
            vec![20, 30]
        );
    }

    #[test]
    fn prune_removes_at_or_below_boundary() {
        let (_dir, store) = temp_store(false);
        let weight = BigRational::from_u64(1).unwrap();
        for created_on in [10, 20, 30] {
            store
                .persist_share(&Share::new("acct".into(), weight.clone(), created_on))
                .unwrap();
        }
        store.prune_shares(20).unwrap();
        let left = store.pplns_eligible_shares(0).unwrap();
        assert_eq!(
            left.iter().map(|s| s.created_on).collect::<Vec<_>>(),
            vec![30]
        );
    }

    #[test]
    fn payment_lifecycle_archives_exactly_once() {
        let (_dir, store) = temp_store(false);
        let mut payment = Payment::new("acct".into(), source(1), 500, 10, 26);
        store.persist_payment(&payment).unwrap();

        payment.paid_on_height = 40;
        payment.transaction_id = hex::encode([9u8; 32]);
        store.update_payment(&payment).unwrap();
        store.archive_payment(&payment).unwrap();

        assert!(store.mature_pending_payments(u32::MAX).unwrap().is_empty());
        assert_eq!(store.archived_payments().unwrap(), vec![payment]);
    }

    #[test]
    fn mature_payments_group_by_block() {
        let (_dir, store) = temp_store(false);
        let a = Payment::new("acct-a".into(), source(1), 100, 5, 21);
        let b = Payment::new("acct-b".into(), source(1), 200, 5, 21);
        let c = Payment::new("acct-c".into(), source(3), 300, 9, 25);
        for pmt in [&a, &b, &c] {
            store.persist_payment(pmt).unwrap();
        }

        let mature = store.mature_pending_payments(21).unwrap();
        assert_eq!(mature.len(), 1);
        assert_eq!(mature[&a.source.block_hash].len(), 2);

        let mature = store.mature_pending_payments(25).unwrap();
        assert_eq!(mature.len(), 2);
        assert_eq!(mature[&c.source.block_hash], vec![c]);
    }

    #[test]
    fn mode_switch_wipes_after_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.kv");
        {
            let store = PoolStore::open(&path, false).unwrap();
            store.persist_account(&Account::new("shgm1qqqq".into())).unwrap();
            store.persist_last_payment_info(7, 7).unwrap();
            store.flush().unwrap();
        }
        let store = PoolStore::open(&path, true).unwrap();
        assert!(matches!(
            store.fetch_account(&crate::account::account_id("shgm1qqqq")),
            Err(PoolError::ValueNotFound(_))
        ));
        assert!(matches!(
            store.load_last_payment_info(),
            Err(PoolError::ValueNotFound(_))
        ));
        assert!(dir.path().join("backup.kv").exists());
    }
}
