#![allow(dead_code)]

use groupbuy_engine::application::manager::SessionManager;
use groupbuy_engine::application::settlement::{EscalationQueue, SettlementService};
use groupbuy_engine::application::sweeper::TimeoutSweeper;
use groupbuy_engine::domain::draw::DrawRecord;
use groupbuy_engine::domain::money::{Amount, Balance};
use groupbuy_engine::domain::participant::{NewParticipant, Participant, ParticipantStatus};
use groupbuy_engine::domain::ports::{
    AdmittedSlot, DebitOutcome, SessionStore, SharedClock, SharedNotificationDispatcher,
    SharedPickupCodeIssuer, SharedProductCatalog, SharedSessionStore, SharedWalletLedger,
    WalletLedger,
};
use groupbuy_engine::domain::product::Product;
use groupbuy_engine::domain::session::{Session, SessionCode, SessionId, UserId};
use groupbuy_engine::error::{EngineError, Result};
use groupbuy_engine::infrastructure::in_memory::{
    InMemorySessionStore, InMemoryWallet, ManualClock, RecordingDispatcher, SequentialPickupCodes,
    StaticCatalog,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Wallet wrapper whose credit path can be switched to fail, for exercising
/// the retry and escalation behavior of settlement. Debits always pass
/// through.
pub struct FlakyWallet {
    inner: Arc<InMemoryWallet>,
    fail_credits: AtomicBool,
}

impl FlakyWallet {
    pub fn new(inner: Arc<InMemoryWallet>) -> Self {
        Self {
            inner,
            fail_credits: AtomicBool::new(false),
        }
    }

    pub fn fail_credits(&self, fail: bool) {
        self.fail_credits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl WalletLedger for FlakyWallet {
    async fn debit(&self, user_id: UserId, amount: Amount, op_key: &str) -> Result<DebitOutcome> {
        self.inner.debit(user_id, amount, op_key).await
    }

    async fn credit(&self, user_id: UserId, amount: Amount, op_key: &str) -> Result<()> {
        if self.fail_credits.load(Ordering::SeqCst) {
            return Err(EngineError::Ledger("wallet unavailable".into()));
        }
        self.inner.credit(user_id, amount, op_key).await
    }
}

/// Store wrapper with one-shot switchable faults, for exercising the
/// manager's compensation paths. Everything else delegates to the backing
/// in-memory store.
pub struct FaultyStore {
    inner: Arc<InMemorySessionStore>,
    fail_next_admit: AtomicBool,
    collide_next_create: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemorySessionStore>) -> Self {
        Self {
            inner,
            fail_next_admit: AtomicBool::new(false),
            collide_next_create: AtomicBool::new(false),
        }
    }

    pub fn fail_next_admit(&self) {
        self.fail_next_admit.store(true, Ordering::SeqCst);
    }

    pub fn collide_next_create(&self) {
        self.collide_next_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SessionStore for FaultyStore {
    async fn create(&self, session: Session, creator: NewParticipant) -> Result<AdmittedSlot> {
        if self.collide_next_create.swap(false, Ordering::SeqCst) {
            return Err(EngineError::CodeCollision);
        }
        self.inner.create(session, creator).await
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<Session>> {
        self.inner.get(session_id).await
    }

    async fn find_by_code(&self, code: &SessionCode) -> Result<Option<Session>> {
        self.inner.find_by_code(code).await
    }

    async fn participants(&self, session_id: SessionId) -> Result<Vec<Participant>> {
        self.inner.participants(session_id).await
    }

    async fn draw_record(&self, session_id: SessionId) -> Result<Option<DrawRecord>> {
        self.inner.draw_record(session_id).await
    }

    async fn admit(
        &self,
        session_id: SessionId,
        participant: NewParticipant,
    ) -> Result<AdmittedSlot> {
        if self.fail_next_admit.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Storage("store unavailable".into()));
        }
        self.inner.admit(session_id, participant).await
    }

    async fn complete_success(&self, session_id: SessionId, record: DrawRecord) -> Result<bool> {
        self.inner.complete_success(session_id, record).await
    }

    async fn claim_timeout(&self, session_id: SessionId) -> Result<bool> {
        self.inner.claim_timeout(session_id).await
    }

    async fn cancel(&self, session_id: SessionId) -> Result<()> {
        self.inner.cancel(session_id).await
    }

    async fn set_participant_status(
        &self,
        session_id: SessionId,
        position: u32,
        status: ParticipantStatus,
    ) -> Result<()> {
        self.inner
            .set_participant_status(session_id, position, status)
            .await
    }

    async fn set_pickup_code(&self, session_id: SessionId, position: u32, code: &str) -> Result<()> {
        self.inner.set_pickup_code(session_id, position, code).await
    }

    async fn expired_sessions(&self, now_millis: i64) -> Result<Vec<Session>> {
        self.inner.expired_sessions(now_millis).await
    }

    async fn all_sessions(&self) -> Result<Vec<Session>> {
        self.inner.all_sessions().await
    }
}

/// Fully wired engine over the in-memory adapters, with the clock and the
/// notification log exposed for assertions.
pub struct Harness {
    pub store: Arc<InMemorySessionStore>,
    pub wallet: Arc<InMemoryWallet>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingDispatcher>,
    pub escalations: EscalationQueue,
    pub settlement: Arc<SettlementService>,
    pub manager: SessionManager,
    pub sweeper: TimeoutSweeper,
}

impl Harness {
    pub fn new(products: Vec<Product>) -> Self {
        let wallet = Arc::new(InMemoryWallet::new());
        let ledger: SharedWalletLedger = wallet.clone();
        let store = Arc::new(InMemorySessionStore::new());
        let store_port: SharedSessionStore = store.clone();
        Self::build(store, store_port, products, wallet, ledger)
    }

    /// A harness whose settlement credits go through the returned
    /// `FlakyWallet`; joins and balances still hit the backing wallet.
    pub fn with_flaky_wallet(products: Vec<Product>) -> (Self, Arc<FlakyWallet>) {
        let wallet = Arc::new(InMemoryWallet::new());
        let flaky = Arc::new(FlakyWallet::new(wallet.clone()));
        let ledger: SharedWalletLedger = flaky.clone();
        let store = Arc::new(InMemorySessionStore::new());
        let store_port: SharedSessionStore = store.clone();
        (Self::build(store, store_port, products, wallet, ledger), flaky)
    }

    /// A harness whose store calls go through the returned `FaultyStore`;
    /// direct store assertions still hit the backing in-memory store.
    pub fn with_faulty_store(products: Vec<Product>) -> (Self, Arc<FaultyStore>) {
        let wallet = Arc::new(InMemoryWallet::new());
        let ledger: SharedWalletLedger = wallet.clone();
        let store = Arc::new(InMemorySessionStore::new());
        let faulty = Arc::new(FaultyStore::new(store.clone()));
        let store_port: SharedSessionStore = faulty.clone();
        (Self::build(store, store_port, products, wallet, ledger), faulty)
    }

    fn build(
        store: Arc<InMemorySessionStore>,
        store_port: SharedSessionStore,
        products: Vec<Product>,
        wallet: Arc<InMemoryWallet>,
        ledger: SharedWalletLedger,
    ) -> Self {
        let catalog: SharedProductCatalog = Arc::new(StaticCatalog::new(products));
        let clock = Arc::new(ManualClock::new(0));
        let clock_port: SharedClock = clock.clone();
        let pickup_codes: SharedPickupCodeIssuer = Arc::new(SequentialPickupCodes::default());
        let notifier = Arc::new(RecordingDispatcher::default());
        let notifier_port: SharedNotificationDispatcher = notifier.clone();
        let escalations = EscalationQueue::default();

        let settlement = Arc::new(SettlementService::new(
            store_port.clone(),
            ledger.clone(),
            pickup_codes,
            notifier_port,
            escalations.clone(),
        ));
        let manager = SessionManager::new(
            store_port.clone(),
            catalog,
            ledger,
            clock_port.clone(),
            settlement.clone(),
            escalations.clone(),
        );
        let sweeper = TimeoutSweeper::new(store_port, settlement.clone(), clock_port);

        Self {
            store,
            wallet,
            clock,
            notifier,
            escalations,
            settlement,
            manager,
            sweeper,
        }
    }

    pub async fn fund(&self, user_id: UserId, amount: Decimal) {
        self.wallet.fund(user_id, Balance::new(amount)).await;
    }

    pub async fn balance(&self, user_id: UserId) -> Decimal {
        self.wallet.balance(user_id).await.0
    }
}

pub fn product(id: u32, price: Decimal, group_size: u32, timeout_millis: i64) -> Product {
    Product {
        id,
        price_per_person: Amount::new(price).unwrap(),
        group_size,
        timeout_millis,
        active: true,
        stock: 100,
        sold: 0,
    }
}

pub fn default_product() -> Product {
    product(1, dec!(10.0), 3, 60_000)
}
