//! Test server wrapper that starts the gateway on a random port

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::SecretString;
use tollgate_auth::key::hash_key;
use tollgate_billing::SettlementEngine;
use tollgate_config::Config;
use tollgate_server::ServerBuilder;
use tollgate_store::{ApiKeyRecord, MemoryStore, ModelPrice, Provider, Service, Transaction, UpstreamEndpoint};
use tokio_util::sync::CancellationToken;

pub const API_KEY: &str = "sk-0123456789abcdefghijABCDEFGHIJklmnopqrstUVWXYZ01";
pub const KEY_ID: i64 = 1;
pub const USER_ID: i64 = 10;
pub const WALLET_ID: i64 = 100;

pub const CHAT_MODEL: &str = "mock-chat";
pub const SPEECH_MODEL: &str = "mock-tts";
pub const TRANSCRIPTION_MODEL: &str = "mock-asr";

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).expect("valid decimal")
}

/// Store seeded with one key, one funded wallet and prices for every service
///
/// Chat costs 1 per million input tokens and 2 per million output tokens,
/// synthesis 2 per million bytes, recognition 36 per hour.
pub fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_key(ApiKeyRecord {
        id: KEY_ID,
        user_id: USER_ID,
        wallet_id: WALLET_ID,
        key_hash: hash_key(API_KEY),
        active: true,
    });
    store.insert_wallet(WALLET_ID, dec("10"));
    store.set_prices(vec![
        ModelPrice {
            model: CHAT_MODEL.to_owned(),
            service: Service::ChatCompletion,
            input_price: dec("1"),
            output_price: dec("2"),
        },
        ModelPrice {
            model: SPEECH_MODEL.to_owned(),
            service: Service::TextToSpeech,
            input_price: dec("2"),
            output_price: Decimal::ZERO,
        },
        ModelPrice {
            model: TRANSCRIPTION_MODEL.to_owned(),
            service: Service::SpeechToText,
            input_price: dec("36"),
            output_price: Decimal::ZERO,
        },
    ]);
    store
}

pub fn endpoint(id: i64, provider: Provider, base_url: &str) -> UpstreamEndpoint {
    UpstreamEndpoint {
        id,
        provider,
        base_url: base_url.to_owned(),
        api_key: SecretString::from(format!("upstream-key-{id}")),
        weight: 1,
    }
}

/// A running test server instance
pub struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    client: reqwest::Client,
    store: Arc<MemoryStore>,
    settlement: Arc<SettlementEngine>,
}

impl TestServer {
    /// Start the gateway over `store`
    ///
    /// Binds to port 0 for automatic port assignment. Background jobs are not
    /// started; tests drive settlement explicitly.
    pub async fn start(config: Config, store: Arc<MemoryStore>) -> anyhow::Result<Self> {
        let server = ServerBuilder::new(config).with_store(store.clone()).build().await?;
        let settlement = server.settlement();

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        // Bind the listener here so we know the actual port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            axum::serve(
                listener,
                server.into_router().into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_clone.cancelled().await;
            })
            .await
            .ok();
        });

        Ok(Self {
            addr,
            shutdown,
            client: reqwest::Client::new(),
            store,
            settlement,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// `POST` with the seeded API key
    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(API_KEY)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn settlement(&self) -> &SettlementEngine {
        &self.settlement
    }

    /// Wait until `count` ledger rows exist
    ///
    /// Streamed calls are recorded by a task that outlives the response.
    pub async fn wait_for_transactions(&self, count: usize) -> Vec<Transaction> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let transactions = self.store.transactions();
            if transactions.len() >= count || tokio::time::Instant::now() >= deadline {
                return transactions;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
