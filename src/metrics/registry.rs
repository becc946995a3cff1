use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

/// All Prometheus metrics of the consensus engine.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<std::sync::Mutex<Registry>>,

    pub height: Gauge<i64, AtomicI64>,
    pub rounds: Gauge<i64, AtomicI64>,
    pub validators: Gauge<i64, AtomicI64>,
    pub validators_power: Gauge<i64, AtomicI64>,
    pub missing_validators: Gauge<i64, AtomicI64>,
    pub missing_validators_power: Gauge<i64, AtomicI64>,
    pub byzantine_validators: Gauge<i64, AtomicI64>,
    pub byzantine_validators_power: Gauge<i64, AtomicI64>,
    pub committed_height: Gauge<i64, AtomicI64>,
    pub num_txs: Gauge<i64, AtomicI64>,
    pub block_size_bytes: Gauge<i64, AtomicI64>,
    pub block_interval_seconds: Histogram,

    pub proposals_received: Counter,
    pub votes_received: Counter,
    pub equivocations: Counter,
    pub timeouts: Counter,
    pub wal_write_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let height = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_height", "Current consensus height", height.clone());

        let rounds = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_rounds", "Current round of the freshest height", rounds.clone());

        let validators = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_validators", "Validators of the committed height", validators.clone());

        let validators_power = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_validators_power", "Total voting power of the committed height", validators_power.clone());

        let missing_validators = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_missing_validators", "Validators absent from the last commit", missing_validators.clone());

        let missing_validators_power = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_missing_validators_power", "Voting power absent from the last commit", missing_validators_power.clone());

        let byzantine_validators = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_byzantine_validators", "Validators with committed evidence", byzantine_validators.clone());

        let byzantine_validators_power = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_byzantine_validators_power", "Voting power with committed evidence", byzantine_validators_power.clone());

        let committed_height = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_committed_height", "Last committed block height", committed_height.clone());

        let num_txs = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_num_txs", "Transactions in the last committed block", num_txs.clone());

        let block_size_bytes = Gauge::<i64, AtomicI64>::default();
        registry.register("pipebft_consensus_block_size_bytes", "Size of the last committed block", block_size_bytes.clone());

        let block_interval_seconds = Histogram::new(exponential_buckets(0.1, 2.0, 10));
        registry.register("pipebft_consensus_block_interval_seconds", "Time between consecutive blocks", block_interval_seconds.clone());

        let proposals_received = Counter::default();
        registry.register("pipebft_consensus_proposals_received_total", "Proposals received", proposals_received.clone());

        let votes_received = Counter::default();
        registry.register("pipebft_consensus_votes_received_total", "Votes received", votes_received.clone());

        let equivocations = Counter::default();
        registry.register("pipebft_consensus_equivocations_total", "Conflicting vote pairs detected", equivocations.clone());

        let timeouts = Counter::default();
        registry.register("pipebft_consensus_timeouts_total", "Timeouts fired", timeouts.clone());

        let wal_write_duration = Histogram::new(exponential_buckets(0.0001, 2.0, 12));
        registry.register("pipebft_storage_wal_write_duration_seconds", "WAL write time", wal_write_duration.clone());

        Self {
            registry: Arc::new(std::sync::Mutex::new(registry)),
            height,
            rounds,
            validators,
            validators_power,
            missing_validators,
            missing_validators_power,
            byzantine_validators,
            byzantine_validators_power,
            committed_height,
            num_txs,
            block_size_bytes,
            block_interval_seconds,
            proposals_received,
            votes_received,
            equivocations,
            timeouts,
            wal_write_duration,
        }
    }

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        let registry = self.registry.lock().unwrap();
        prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
