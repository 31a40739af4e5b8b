use anyhow::Result;
use relay_events::{
    Config, ConsumerOption, Event, GenericReader, HandlerError, HandlerOption, Mode, System,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Opened {
    account_id: String,
    initial_balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Moved {
    account_id: String,
    amount: i64,
}

/// 由事件投影出的账户余额
#[derive(Default)]
struct Ledger {
    balances: HashMap<String, i64>,
}

impl Ledger {
    fn open(&mut self, event: &Opened) -> Result<(), HandlerError> {
        if self.balances.contains_key(&event.account_id) {
            return Err(HandlerError::discard(anyhow::anyhow!(
                "account {} already opened",
                event.account_id
            )));
        }
        self.balances
            .insert(event.account_id.clone(), event.initial_balance);
        Ok(())
    }

    fn apply(&mut self, event: &Moved) -> Result<(), HandlerError> {
        let Some(balance) = self.balances.get_mut(&event.account_id) else {
            // 开户事件可能尚未处理，交给回收后重试
            return Err(anyhow::anyhow!("account {} not opened yet", event.account_id).into());
        };
        if *balance + event.amount < 0 {
            return Err(HandlerError::discard(anyhow::anyhow!(
                "insufficient funds on {}",
                event.account_id
            )));
        }
        *balance += event.amount;
        Ok(())
    }
}

fn config_from_env() -> Result<Config> {
    let mut config = Config::default();
    if let Ok(mode) = std::env::var("RELAY_MODE") {
        config.mode = mode.parse::<Mode>()?;
    }
    if let Ok(url) = std::env::var("RELAY_REDIS_URL") {
        config.redis_url = url;
    }
    if let Ok(namespace) = std::env::var("RELAY_NAMESPACE") {
        config.namespace = namespace;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let system = System::new(config_from_env()?).await?;
    let ledger = Arc::new(Mutex::new(Ledger::default()));
    let handler_options = [
        HandlerOption::idle_timeout(Duration::from_secs(10))?,
        HandlerOption::max_retries(3)?,
    ];

    let token = CancellationToken::new();
    let reader = {
        let opened = ledger.clone();
        let moved = ledger.clone();
        system
            .reader_factory::<GenericReader>("account")?
            .launch(&token, "ledger", "ledger-1", move |r| {
                r.configure(&[ConsumerOption::concurrency(1)?]);
                r.register_event(
                    "opened",
                    move |event: Event<Opened>| {
                        let result = opened
                            .lock()
                            .map_err(|_| HandlerError::from(anyhow::anyhow!("ledger poisoned")))
                            .and_then(|mut ledger| ledger.open(&event.payload));
                        async move { result }
                    },
                    &handler_options,
                )?;
                r.register_event(
                    "moved",
                    move |event: Event<Moved>| {
                        let result = moved
                            .lock()
                            .map_err(|_| HandlerError::from(anyhow::anyhow!("ledger poisoned")))
                            .and_then(|mut ledger| ledger.apply(&event.payload));
                        async move { result }
                    },
                    &handler_options,
                )
            })
            .await?
    };

    let reporter = system.reporter("account")?;
    reporter
        .send_event(
            "opened",
            &Opened {
                account_id: "acc-1".into(),
                initial_balance: 100,
            },
        )
        .await?;
    // 进程内后端不重投，先等开户事件处理完成
    tokio::time::sleep(Duration::from_millis(100)).await;
    for amount in [50, -30, -500] {
        reporter
            .send_event(
                "moved",
                &Moved {
                    account_id: "acc-1".into(),
                    amount,
                },
            )
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    if let Ok(ledger) = ledger.lock() {
        for (account, balance) in &ledger.balances {
            tracing::info!(%account, balance, "ledger balance");
        }
    }

    reader.cancel();
    reader.join().await;
    Ok(())
}
