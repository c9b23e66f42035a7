use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::chain::{parse_hash, Address, ChainParams};
use crate::error::{PoolError, PoolResult};
use crate::payment::{now_nanos, Payment, PaymentSource, POOL_FEES_ID};
use crate::rpc::{
    ConfNotifReceiver, PublishTransactionRequest, SignTransactionRequest, TransactionInput,
    TxBroadcaster, TxCreator, TX_TREE_REGULAR,
};
use crate::share::Share;
use crate::store::PoolStore;
use crate::txrules::{
    estimate_serialize_size_from_script_sizes, fee_for_serialize_size, is_dust_amount,
    ATOMS_PER_COIN, DEFAULT_RELAY_FEE_PER_KB, P2PKH_OUTPUT_SIZE, REDEEM_P2PKH_SIG_SCRIPT_SIZE,
};

/// Maximum number of atoms the total output value of a payout transaction
/// is allowed to be short of the provided input due to rounding errors.
pub const MAX_ROUNDING_DIFF: i64 = 500;

/// The reward distribution scheme of the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentMethod {
    /// Pay per share: every share since the last payout counts.
    Pps,
    /// Pay per last n shares: only shares within the trailing window
    /// count.
    Pplns,
}

impl FromStr for PaymentMethod {
    type Err = PoolError;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        match method {
            "pps" => Ok(PaymentMethod::Pps),
            "pplns" => Ok(PaymentMethod::Pplns),
            other => Err(PoolError::UnknownPaymentMethod(other.to_string())),
        }
    }
}

/// Configuration values required when creating a payment manager.
pub struct PaymentMgrConfig {
    /// The network being mined on.
    pub chain: ChainParams,
    /// The fee charged to participating accounts, as a fraction in [0, 1].
    pub pool_fee: f64,
    /// The period to source shares from under the PPLNS scheme.
    pub last_n_period: Duration,
    /// Whether the pool is mining in solo mode.
    pub solo_pool: bool,
    /// The reward distribution scheme.
    pub payment_method: PaymentMethod,
    /// The pool fee addresses. One is picked at random per payout batch.
    pub pool_fee_addrs: Vec<Address>,
    /// The wallet account to process payments from.
    pub wallet_account: u32,
    /// The passphrase unlocking the wallet for signing.
    pub wallet_pass: String,
    /// How long to wait for coinbase confirmations when generating a
    /// payout transaction.
    pub coinbase_conf_timeout: Duration,
    /// Overrides the time-based seed of the fee-address picker. Used by
    /// tests that need a deterministic pick.
    pub rng_seed: Option<u64>,
}

/// Handles generating payments from shares and paying out dividends to
/// participating accounts.
pub struct PaymentMgr {
    cfg: PaymentMgrConfig,
    db: Arc<PoolStore>,
    rng: Mutex<StdRng>,
    tx_creator: RwLock<Option<Arc<dyn TxCreator>>>,
    tx_broadcaster: RwLock<Option<Arc<dyn TxBroadcaster>>>,
}

impl PaymentMgr {
    pub fn new(db: Arc<PoolStore>, cfg: PaymentMgrConfig) -> PoolResult<Self> {
        let seed = cfg.rng_seed.unwrap_or_else(|| now_nanos() as u64);
        let mgr = Self {
            cfg,
            db,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            tx_creator: RwLock::new(None),
            tx_broadcaster: RwLock::new(None),
        };

        match mgr.db.load_last_payment_info() {
            Ok(_) => {}
            Err(PoolError::ValueNotFound(_)) => mgr.db.persist_last_payment_info(0, 0)?,
            Err(err) => return Err(err),
        }
        match mgr.db.load_last_payment_created_on() {
            Ok(_) => {}
            Err(PoolError::ValueNotFound(_)) => mgr.db.persist_last_payment_created_on(0)?,
            Err(err) => return Err(err),
        }

        Ok(mgr)
    }

    /// Installs or clears the chain client used for coinbase lookups and
    /// payout transaction creation.
    pub fn set_tx_creator(&self, creator: Option<Arc<dyn TxCreator>>) {
        *self.tx_creator.write() = creator;
    }

    /// Installs or clears the wallet client used for signing and
    /// broadcasting.
    pub fn set_tx_broadcaster(&self, broadcaster: Option<Arc<dyn TxBroadcaster>>) {
        *self.tx_broadcaster.write() = broadcaster;
    }

    /// Calculates the percentage due each participating account from the
    /// provided weighted shares. The ratios sum to one exactly.
    fn share_percentages(&self, shares: &[Share]) -> PoolResult<HashMap<String, BigRational>> {
        let mut total = BigRational::zero();
        let mut tally: HashMap<String, BigRational> = HashMap::new();
        for share in shares {
            total += &share.weight;
            tally
                .entry(share.account.clone())
                .and_modify(|weight| *weight += &share.weight)
                .or_insert_with(|| share.weight.clone());
        }

        let mut percentages = HashMap::with_capacity(tally.len());
        for (account, weight) in tally {
            if weight.is_zero() {
                return Err(PoolError::DivideByZero("division by zero".into()));
            }
            percentages.insert(account, &weight / &total);
        }
        Ok(percentages)
    }

    /// Calculates the reward percentages due participating accounts under
    /// the PPS scheme, from all shares created at or before the rewarded
    /// work.
    pub fn pps_share_percentages(
        &self,
        work_created_on: i64,
    ) -> PoolResult<HashMap<String, BigRational>> {
        let shares = self.db.pps_eligible_shares(work_created_on)?;
        if shares.is_empty() {
            return Ok(HashMap::new());
        }
        self.share_percentages(&shares)
    }

    /// Calculates the reward percentages due participating accounts under
    /// the PPLNS scheme, from shares within the trailing window.
    pub fn pplns_share_percentages(&self) -> PoolResult<HashMap<String, BigRational>> {
        let min = now_nanos() - self.cfg.last_n_period.as_nanos() as i64;
        let shares = self.db.pplns_eligible_shares(min)?;
        if shares.is_empty() {
            return Ok(HashMap::new());
        }
        self.share_percentages(&shares)
    }

    /// Creates the payments due participating accounts from their reward
    /// ratios. Amounts below the dust threshold are forfeited to the pool
    /// fee payment, which always absorbs rounding remainders. Returns the
    /// payments and the creation time of the fee payment.
    fn calculate_payments(
        &self,
        ratios: &HashMap<String, BigRational>,
        source: &PaymentSource,
        total: i64,
        pool_fee: f64,
        height: u32,
        est_maturity: u32,
    ) -> PoolResult<(Vec<Payment>, i64)> {
        if ratios.is_empty() {
            return Err(PoolError::ShareRatio(
                "valid share ratios required to generate payments".into(),
            ));
        }

        let fee = (total as f64 * pool_fee).floor() as i64;
        let amt_sans_fees = total - fee;
        let sans_fees = BigRational::from_integer(BigInt::from(amt_sans_fees));

        let mut payment_total = 0i64;
        let mut dust_total = 0i64;
        let mut payments = Vec::with_capacity(ratios.len() + 1);
        for (account, ratio) in ratios {
            let amt_rat = &sans_fees * ratio;
            let amt = amt_rat.to_integer().to_i64().ok_or_else(|| {
                PoolError::CreateAmount(format!("payment amount for {account} out of range"))
            })?;
            payment_total += amt;

            // Dust payments would make the payout transaction error and
            // are forfeited to the pool fee payout.
            if is_dust_amount(amt, P2PKH_OUTPUT_SIZE, DEFAULT_RELAY_FEE_PER_KB) {
                dust_total += amt;
            } else {
                payments.push(Payment::new(
                    account.clone(),
                    source.clone(),
                    amt,
                    height,
                    est_maturity,
                ));
            }
        }

        if amt_sans_fees < payment_total {
            return Err(PoolError::PaymentSource(format!(
                "total payments ({payment_total}) is greater than the remaining \
                 coinbase amount after fees ({amt_sans_fees})"
            )));
        }

        let fee_payment = Payment::new(
            POOL_FEES_ID.to_string(),
            source.clone(),
            fee + dust_total,
            height,
            est_maturity,
        );
        let created_on = fee_payment.created_on;
        payments.push(fee_payment);

        Ok((payments, created_on))
    }

    /// Generates a payment bundle for all accounts with work contributed
    /// since the last payout batch.
    fn pay_per_share(
        &self,
        source: &PaymentSource,
        amt: i64,
        height: u32,
        work_created_on: i64,
    ) -> PoolResult<()> {
        let percentages = self.pps_share_percentages(work_created_on)?;
        if percentages.is_empty() {
            return Ok(());
        }
        let est_maturity = height + u32::from(self.cfg.chain.coinbase_maturity);
        let (payments, last_created_on) = self.calculate_payments(
            &percentages,
            source,
            amt,
            self.cfg.pool_fee,
            height,
            est_maturity,
        )?;
        for payment in &payments {
            self.db.persist_payment(payment)?;
        }
        self.db.persist_last_payment_created_on(last_created_on)?;
        self.db.prune_shares(work_created_on)
    }

    /// Generates a payment bundle for all accounts with work contributed
    /// within the trailing share window.
    fn pay_per_last_n_shares(&self, source: &PaymentSource, amt: i64, height: u32) -> PoolResult<()> {
        let percentages = self.pplns_share_percentages()?;
        if percentages.is_empty() {
            return Ok(());
        }
        let est_maturity = height + u32::from(self.cfg.chain.coinbase_maturity);
        let (payments, last_created_on) = self.calculate_payments(
            &percentages,
            source,
            amt,
            self.cfg.pool_fee,
            height,
            est_maturity,
        )?;
        for payment in &payments {
            self.db.persist_payment(payment)?;
        }
        self.db.persist_last_payment_created_on(last_created_on)?;
        let min = now_nanos() - self.cfg.last_n_period.as_nanos() as i64;
        self.db.prune_shares(min)
    }

    /// Creates payments for participating accounts. Called once per
    /// confirmed mined block, in pool mining mode.
    pub fn generate_payments(
        &self,
        height: u32,
        source: &PaymentSource,
        amt: i64,
        work_created_on: i64,
    ) -> PoolResult<()> {
        match self.cfg.payment_method {
            PaymentMethod::Pps => self.pay_per_share(source, amt, height, work_created_on),
            PaymentMethod::Pplns => self.pay_per_last_n_shares(source, amt, height),
        }
    }

    /// Removes payment groups sourced from orphaned blocks. Orphaned
    /// payments stay untouched in the store; they never mature against
    /// the main chain from here on.
    async fn prune_orphaned_payments(
        &self,
        creator: &dyn TxCreator,
        mut payments: HashMap<String, Vec<Payment>>,
    ) -> PoolResult<HashMap<String, Vec<Payment>>> {
        let mut orphaned = Vec::with_capacity(payments.len());
        for block_hash in payments.keys() {
            parse_hash(block_hash)?;
            let confs = creator.get_block_confirmations(block_hash).await?;
            if confs <= 0 {
                orphaned.push(block_hash.clone());
            }
        }
        for block_hash in orphaned {
            trace!(block = %block_hash, "pruned orphaned payment group");
            payments.remove(&block_hash);
        }
        Ok(payments)
    }

    /// Creates the payout transaction inputs and outputs from the
    /// provided payment groups. Returns the inputs, the set of coinbase
    /// hashes they spend, the per-address output values and the total
    /// output value.
    async fn generate_payout_tx_details(
        &self,
        creator: &dyn TxCreator,
        fee_addr: &Address,
        payments: &HashMap<String, Vec<Payment>>,
        treasury_active: bool,
    ) -> PoolResult<(
        Vec<TransactionInput>,
        HashSet<String>,
        HashMap<String, i64>,
        i64,
    )> {
        // The coinbase output funding the pool sits at the second index
        // position once the treasury rule is active, at the third before.
        let coinbase_index: u32 = if treasury_active { 1 } else { 2 };

        let mut t_in = 0i64;
        let mut t_out = 0i64;
        let mut inputs = Vec::with_capacity(payments.len());
        let mut input_tx_hashes = HashSet::with_capacity(payments.len());
        let mut outputs: HashMap<String, i64> = HashMap::new();
        for pmt_set in payments.values() {
            let coinbase = &pmt_set[0].source.coinbase;
            parse_hash(coinbase)?;

            let tx_out = creator
                .get_tx_out(coinbase, coinbase_index, false)
                .await
                .map_err(|err| PoolError::TxOut(format!("unable to find tx output: {err}")))?
                .ok_or_else(|| {
                    PoolError::TxOut(format!(
                        "no spendable output for tx {coinbase} at index {coinbase_index}"
                    ))
                })?;
            if tx_out.confirmations < i64::from(self.cfg.chain.coinbase_maturity) + 1 {
                return Err(PoolError::Coinbase(format!(
                    "referenced coinbase at index {coinbase_index} for tx {coinbase} \
                     is not spendable"
                )));
            }

            inputs.push(TransactionInput {
                amount: tx_out.value,
                txid: coinbase.clone(),
                vout: coinbase_index,
                tree: TX_TREE_REGULAR,
            });
            input_tx_hashes.insert(coinbase.clone());
            t_in += coin_to_atoms(tx_out.value)?;

            for pmt in pmt_set {
                let address = if pmt.account == POOL_FEES_ID {
                    fee_addr.encode()
                } else {
                    self.db.fetch_account(&pmt.account)?.address
                };
                *outputs.entry(address).or_insert(0) += pmt.amount;
                t_out += pmt.amount;
            }
        }

        if t_out > t_in {
            return Err(PoolError::CreateTx(format!(
                "total output value ({t_out}) is greater than the provided inputs ({t_in})"
            )));
        }
        let diff = t_in - t_out;
        if diff > MAX_ROUNDING_DIFF {
            return Err(PoolError::CreateTx(format!(
                "difference between total output value and the provided inputs ({diff}) \
                 exceeds the maximum allowed for rounding errors ({MAX_ROUNDING_DIFF})"
            )));
        }

        Ok((inputs, input_tx_hashes, outputs, t_out))
    }

    /// Determines the on-chain fee of the payout transaction and deducts
    /// portions of it from the outputs of participating accounts. The
    /// deducted portion of an output is the estimated fee scaled by the
    /// ratio of the post-fee batch total to the output value, so larger
    /// recipients shoulder proportionally more. The pool fee output is
    /// left intact. Returns the batch total net of the estimated fee, and
    /// the estimated fee.
    fn apply_tx_fees(
        &self,
        inputs: &[TransactionInput],
        outputs: &mut HashMap<String, i64>,
        t_out: i64,
        fee_addr: &Address,
    ) -> PoolResult<(i64, i64)> {
        if inputs.is_empty() {
            return Err(PoolError::TxIn(
                "cannot create a payout transaction without a tx input".into(),
            ));
        }
        if outputs.is_empty() {
            return Err(PoolError::TxOut(
                "cannot create a payout transaction without a tx output".into(),
            ));
        }

        let in_sizes = vec![REDEEM_P2PKH_SIG_SCRIPT_SIZE; inputs.len()];
        let out_sizes = vec![P2PKH_OUTPUT_SIZE; outputs.len()];
        let est_size = estimate_serialize_size_from_script_sizes(&in_sizes, &out_sizes, 0);
        let est_fee = fee_for_serialize_size(DEFAULT_RELAY_FEE_PER_KB, est_size);
        let sans_fees = t_out - est_fee;

        let fee_addr = fee_addr.encode();
        for (address, value) in outputs.iter_mut() {
            if *address == fee_addr {
                continue;
            }
            let ratio = sans_fees as f64 / *value as f64;
            let out_fee = (est_fee as f64 * ratio).round() as i64;
            *value -= out_fee;
        }

        Ok((sans_fees, est_fee))
    }

    /// Waits until the coinbases referenced by the provided transaction
    /// hashes are spendable at the expected maximum spendable height.
    async fn confirm_coinbases(
        &self,
        cancel: &CancellationToken,
        notifs: &mut ConfNotifReceiver,
        mut tx_hashes: HashSet<String>,
    ) -> PoolResult<()> {
        let max_spendable_confs = i32::from(self.cfg.chain.coinbase_maturity) + 1;
        loop {
            let batch = fetch_tx_conf_notifications(cancel, notifs).await?;
            for conf in batch.confirmations {
                if conf.confirmations >= max_spendable_confs {
                    parse_hash(&conf.tx_hash)?;
                    // All coinbases are spendable once the set is empty.
                    tx_hashes.remove(&conf.tx_hash);
                }
            }
            if tx_hashes.is_empty() {
                return Ok(());
            }
        }
    }

    /// Pays mature mining rewards to participating accounts.
    ///
    /// Cancellation or a timeout while waiting on coinbase maturity
    /// aborts the batch without broadcasting or mutating the store and
    /// reports success, so shutdown is never blocked. Failures past the
    /// publish step leave a broadcast transaction with unrecorded
    /// payments and require operator intervention.
    pub async fn pay_dividends(
        &self,
        cancel: &CancellationToken,
        height: u32,
        treasury_active: bool,
    ) -> PoolResult<()> {
        let mature = self.db.mature_pending_payments(height)?;
        if mature.is_empty() {
            return Ok(());
        }

        let creator = self
            .tx_creator
            .read()
            .clone()
            .ok_or_else(|| PoolError::Disconnected("tx creator unavailable".into()))?;

        // Orphaned blocks are no longer part of the main chain, so their
        // payments are dropped from the batch.
        let payments = self.prune_orphaned_payments(creator.as_ref(), mature).await?;

        // The fee address is picked at random per batch to make it
        // difficult for third parties to track the cumulative value
        // accrued by pool operators.
        let fee_addr = {
            let mut rng = self.rng.lock();
            let index = rng.gen_range(0..self.cfg.pool_fee_addrs.len());
            self.cfg.pool_fee_addrs[index].clone()
        };

        let (inputs, input_tx_hashes, mut outputs, t_out) = self
            .generate_payout_tx_details(creator.as_ref(), &fee_addr, &payments, treasury_active)
            .await?;
        let (_, est_fee) = self.apply_tx_fees(&inputs, &mut outputs, t_out, &fee_addr)?;

        let mut outs: HashMap<Address, i64> = HashMap::with_capacity(outputs.len());
        for (address, amt) in &outputs {
            let decoded = Address::decode(address, &self.cfg.chain)
                .map_err(|err| PoolError::Decode(format!("unable to decode payout address: {err}")))?;
            outs.insert(decoded, *amt);
        }

        // Make sure the wallet is aware of all the coinbase outputs being
        // spent by the payout transaction before asking it to sign.
        let mut max_spendable_height = height;
        for pmt_set in payments.values() {
            let spendable_height = pmt_set[0].estimated_maturity + 1;
            if spendable_height > max_spendable_height {
                max_spendable_height = spendable_height;
            }
        }

        let broadcaster = self
            .tx_broadcaster
            .read()
            .clone()
            .ok_or_else(|| PoolError::Disconnected("tx broadcaster unavailable".into()))?;

        let mut notifs = broadcaster
            .confirmation_notifications(
                input_tx_hashes.iter().cloned().collect(),
                max_spendable_height as i32,
            )
            .await?;
        let wait = self.confirm_coinbases(cancel, &mut notifs, input_tx_hashes);
        match tokio::time::timeout(self.cfg.coinbase_conf_timeout, wait).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_cancellation() => {
                trace!("cancelled while confirming coinbase transactions");
                return Ok(());
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                trace!("timed out while confirming coinbase transactions");
                return Ok(());
            }
        }

        let tx = creator
            .create_raw_transaction(&inputs, &outs, None, None)
            .await
            .map_err(|err| PoolError::CreateTx(format!("unable to create transaction: {err}")))?;

        let signed = broadcaster
            .sign_transaction(SignTransactionRequest {
                serialized_transaction: tx,
                passphrase: self.cfg.wallet_pass.clone(),
            })
            .await
            .map_err(|err| PoolError::SignTx(format!("unable to sign transaction: {err}")))?;

        let published = broadcaster
            .publish_transaction(PublishTransactionRequest {
                signed_transaction: signed.transaction,
            })
            .await
            .map_err(|err| PoolError::PublishTx(format!("unable to publish transaction: {err}")))?;

        let txid = published.transaction_hash;
        parse_hash(&txid)?;
        let fees = outputs.get(&fee_addr.encode()).copied().unwrap_or(0);
        info!(
            total = t_out,
            txid = %txid,
            pool_fees = fees,
            tx_fee = est_fee,
            "paid dividends"
        );

        // Mark all associated payments as paid and archive them.
        for pmt_set in payments.values() {
            for pmt in pmt_set {
                let mut pmt = pmt.clone();
                pmt.paid_on_height = height;
                pmt.transaction_id = txid.clone();
                self.db.update_payment(&pmt)?;
                self.db.archive_payment(&pmt)?;
            }
        }

        self.db.persist_last_payment_info(height, now_nanos())
    }
}

/// Delivers the next confirmation batch from the notification stream, or
/// aborts when the dividend context is cancelled.
async fn fetch_tx_conf_notifications(
    cancel: &CancellationToken,
    notifs: &mut ConfNotifReceiver,
) -> PoolResult<crate::rpc::ConfirmationBatch> {
    tokio::select! {
        _ = cancel.cancelled() => Err(PoolError::ContextCancelled(
            "cancelled while fetching tx confirmation notifications".into(),
        )),
        notif = notifs.recv() => match notif {
            None => Err(PoolError::TxConf(
                "tx confirmation notification stream ended".into(),
            )),
            Some(Err(err)) => Err(PoolError::TxConf(format!(
                "unable to fetch tx confirmation notifications: {err}"
            ))),
            Some(Ok(batch)) => Ok(batch),
        },
    }
}

/// Converts a coin-denominated value reported by the chain node into
/// atoms.
fn coin_to_atoms(value: f64) -> PoolResult<i64> {
    if !value.is_finite() || value < 0.0 {
        return Err(PoolError::CreateAmount(format!(
            "invalid coin amount {value}"
        )));
    }
    Ok((value * ATOMS_PER_COIN as f64).round() as i64)
}

#[cfg(test)]
mod tests {
    use num_traits::One;
    use tempfile::TempDir;

    use super::*;
    use crate::chain::SIMNET;

    fn test_mgr(method: PaymentMethod) -> (TempDir, Arc<PoolStore>, PaymentMgr) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(PoolStore::open(dir.path().join("pool.kv"), false).expect("open store"));
        let cfg = PaymentMgrConfig {
            chain: SIMNET,
            pool_fee: 0.01,
            last_n_period: Duration::from_secs(60),
            solo_pool: false,
            payment_method: method,
            pool_fee_addrs: vec![Address::new(0, [1; 20], &SIMNET)],
            wallet_account: 0,
            wallet_pass: "pass".into(),
            coinbase_conf_timeout: Duration::from_secs(5),
            rng_seed: Some(42),
        };
        let mgr = PaymentMgr::new(db.clone(), cfg).expect("payment manager");
        (dir, db, mgr)
    }

    fn source() -> PaymentSource {
        PaymentSource {
            block_hash: hex::encode([2u8; 32]),
            coinbase: hex::encode([3u8; 32]),
        }
    }

    fn ratio(n: i64, d: i64) -> BigRational {
        BigRational::new(BigInt::from(n), BigInt::from(d))
    }

    #[test]
    fn new_mgr_seeds_checkpoints() {
        let (_dir, db, _mgr) = test_mgr(PaymentMethod::Pps);
        assert_eq!(db.load_last_payment_info().unwrap(), (0, 0));
        assert_eq!(db.load_last_payment_created_on().unwrap(), 0);
    }

    #[test]
    fn unknown_payment_method_is_rejected() {
        assert!(matches!(
            "prop".parse::<PaymentMethod>(),
            Err(PoolError::UnknownPaymentMethod(_))
        ));
        assert_eq!("pps".parse::<PaymentMethod>().unwrap(), PaymentMethod::Pps);
        assert_eq!(
            "pplns".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::Pplns
        );
    }

    #[test]
    fn share_percentages_sum_to_one() {
        let (_dir, _db, mgr) = test_mgr(PaymentMethod::Pps);
        let shares = vec![
            Share::new("a".into(), ratio(1, 1), 1),
            Share::new("b".into(), ratio(3, 1), 2),
            Share::new("a".into(), ratio(1, 1), 3),
        ];
        let percentages = mgr.share_percentages(&shares).unwrap();
        assert_eq!(percentages["a"], ratio(2, 5));
        assert_eq!(percentages["b"], ratio(3, 5));
        let sum = percentages
            .values()
            .fold(BigRational::zero(), |acc, ratio| acc + ratio);
        assert!(sum.is_one());
    }

    #[test]
    fn zero_weight_tally_is_division_by_zero() {
        let (_dir, _db, mgr) = test_mgr(PaymentMethod::Pps);
        let shares = vec![
            Share::new("a".into(), ratio(1, 1), 1),
            Share::new("b".into(), ratio(0, 1), 2),
        ];
        assert!(matches!(
            mgr.share_percentages(&shares),
            Err(PoolError::DivideByZero(_))
        ));
    }

    #[test]
    fn calculate_payments_distributes_full_reward() {
        let (_dir, _db, mgr) = test_mgr(PaymentMethod::Pps);
        let mut ratios = HashMap::new();
        ratios.insert("a".to_string(), ratio(1, 4));
        ratios.insert("b".to_string(), ratio(3, 4));

        let (payments, created_on) = mgr
            .calculate_payments(&ratios, &source(), 1_000_000, 0.01, 10, 26)
            .unwrap();

        let amount_for = |account: &str| {
            payments
                .iter()
                .find(|pmt| pmt.account == account)
                .map(|pmt| pmt.amount)
                .unwrap()
        };
        assert_eq!(amount_for("a"), 247_500);
        assert_eq!(amount_for("b"), 742_500);
        assert_eq!(amount_for(POOL_FEES_ID), 10_000);
        let total: i64 = payments.iter().map(|pmt| pmt.amount).sum();
        assert_eq!(total, 1_000_000);

        let fee_payments = payments
            .iter()
            .filter(|pmt| pmt.account == POOL_FEES_ID)
            .count();
        assert_eq!(fee_payments, 1);
        assert!(created_on > 0);
        assert!(payments.iter().all(|pmt| pmt.estimated_maturity == 26));
    }

    #[test]
    fn dust_payments_are_forfeited_to_fees() {
        let (_dir, _db, mgr) = test_mgr(PaymentMethod::Pps);
        let mut ratios = HashMap::new();
        ratios.insert("a".to_string(), ratio(1, 1));

        let (payments, _) = mgr
            .calculate_payments(&ratios, &source(), 1000, 0.01, 10, 26)
            .unwrap();

        // The only non-fee amount (990 atoms) is dust and folds into the
        // fee payment.
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].account, POOL_FEES_ID);
        assert_eq!(payments[0].amount, 1000);
    }

    #[test]
    fn empty_ratios_are_rejected() {
        let (_dir, _db, mgr) = test_mgr(PaymentMethod::Pps);
        let ratios = HashMap::new();
        assert!(matches!(
            mgr.calculate_payments(&ratios, &source(), 1_000_000, 0.01, 10, 26),
            Err(PoolError::ShareRatio(_))
        ));
    }

    #[test]
    fn pps_generation_persists_and_prunes() {
        let (_dir, db, mgr) = test_mgr(PaymentMethod::Pps);
        let now = now_nanos();
        db.persist_share(&Share::new("a".into(), ratio(1, 1), now - 10))
            .unwrap();
        db.persist_share(&Share::new("b".into(), ratio(3, 1), now - 5))
            .unwrap();
        // Created after the rewarded work; survives the payout.
        db.persist_share(&Share::new("c".into(), ratio(5, 1), now + 10))
            .unwrap();

        mgr.generate_payments(10, &source(), 1_000_000, now).unwrap();

        let mature = db.mature_pending_payments(10 + 16).unwrap();
        let batch = &mature[&source().block_hash];
        assert_eq!(batch.len(), 3);
        let total: i64 = batch.iter().map(|pmt| pmt.amount).sum();
        assert_eq!(total, 1_000_000);

        let left = db.pplns_eligible_shares(0).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].account, "c");
        assert!(db.load_last_payment_created_on().unwrap() > 0);
    }

    #[test]
    fn empty_share_set_short_circuits() {
        let (_dir, db, mgr) = test_mgr(PaymentMethod::Pps);
        mgr.generate_payments(10, &source(), 1_000_000, now_nanos())
            .unwrap();
        assert!(db.mature_pending_payments(u32::MAX).unwrap().is_empty());
    }

    #[test]
    fn apply_tx_fees_spares_fee_output() {
        let (_dir, _db, mgr) = test_mgr(PaymentMethod::Pps);
        let fee_addr = Address::new(0, [1; 20], &SIMNET);
        let acct_addr = Address::new(0, [9; 20], &SIMNET).encode();
        let inputs = vec![TransactionInput {
            amount: 1.0,
            txid: hex::encode([3u8; 32]),
            vout: 2,
            tree: TX_TREE_REGULAR,
        }];
        let mut outputs = HashMap::new();
        outputs.insert(acct_addr.clone(), 90_000_000i64);
        outputs.insert(fee_addr.encode(), 10_000_000i64);

        let (sans_fees, est_fee) = mgr
            .apply_tx_fees(&inputs, &mut outputs, 100_000_000, &fee_addr)
            .unwrap();

        // One input, two outputs: 271 bytes at the default relay fee.
        assert_eq!(est_fee, 2710);
        assert_eq!(sans_fees, 100_000_000 - 2710);
        assert_eq!(outputs[&fee_addr.encode()], 10_000_000);
        let deducted = (est_fee as f64 * (sans_fees as f64 / 90_000_000f64)).round() as i64;
        assert_eq!(outputs[&acct_addr], 90_000_000 - deducted);
    }

    #[test]
    fn apply_tx_fees_requires_inputs_and_outputs() {
        let (_dir, _db, mgr) = test_mgr(PaymentMethod::Pps);
        let fee_addr = Address::new(0, [1; 20], &SIMNET);
        let mut outputs = HashMap::new();
        outputs.insert(fee_addr.encode(), 100i64);
        assert!(matches!(
            mgr.apply_tx_fees(&[], &mut outputs, 100, &fee_addr),
            Err(PoolError::TxIn(_))
        ));

        let inputs = vec![TransactionInput {
            amount: 1.0,
            txid: hex::encode([3u8; 32]),
            vout: 2,
            tree: TX_TREE_REGULAR,
        }];
        let mut outputs = HashMap::new();
        assert!(matches!(
            mgr.apply_tx_fees(&inputs, &mut outputs, 0, &fee_addr),
            Err(PoolError::TxOut(_))
        ));
    }

    #[test]
    fn coin_conversion_bounds() {
        assert_eq!(coin_to_atoms(1.0).unwrap(), ATOMS_PER_COIN);
        assert_eq!(coin_to_atoms(0.000_000_01).unwrap(), 1);
        assert!(coin_to_atoms(-1.0).is_err());
        assert!(coin_to_atoms(f64::NAN).is_err());
    }
}
