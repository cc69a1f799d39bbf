// Copyright 2022. The Agora Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The wallet seam. Payment execution and chain observation live behind
//! [`WalletBackend`]; the order service only consumes addresses, txids and the
//! event stream. [`MemoryWallet`] is the in-process implementation used in tests
//! and demos, where "the chain" is a broadcast channel.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
    Mutex,
};

use agora_key_manager::multisig::SpendPackage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CHANNEL_SIZE: usize = 128;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Wallet backend error: {0}")]
    Backend(String),
    #[error("Insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },
}

/// What the node observes on the payment network for addresses it watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    FundsReceived {
        address: String,
        txid: String,
        amount: u64,
    },
    /// An outgoing transaction from a watched address, whoever authored it.
    SpendObserved {
        address: String,
        txid: String,
        destination: String,
        amount: u64,
    },
}

#[async_trait]
pub trait WalletBackend: Send + Sync + 'static {
    /// A fresh receive address under this wallet's control.
    async fn new_address(&self) -> Result<String, WalletError>;

    /// Pays `amount` to an arbitrary address and returns the txid.
    async fn send_to_address(&self, address: &str, amount: u64) -> Result<String, WalletError>;

    /// Broadcasts a fully-signed escrow spend and returns its txid.
    async fn broadcast_spend(&self, source_address: &str, package: &SpendPackage) -> Result<String, WalletError>;

    /// Subscribes to observations for all watched addresses.
    fn subscribe(&self) -> broadcast::Receiver<WalletEvent>;

    /// The network fee one escrow release costs; refund accounting nets this out.
    fn escrow_release_fee(&self) -> u64;
}

/// A self-contained wallet where sends are immediately "confirmed" and every
/// participant sharing the instance sees the same events.
pub struct MemoryWallet {
    events: broadcast::Sender<WalletEvent>,
    counter: AtomicU64,
    balances: Mutex<std::collections::HashMap<String, u64>>,
    release_fee: u64,
}

impl MemoryWallet {
    pub fn new(release_fee: u64) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Arc::new(Self {
            events,
            counter: AtomicU64::new(0),
            balances: Mutex::new(Default::default()),
            release_fee,
        })
    }

    fn next(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn balance(&self, address: &str) -> u64 {
        *self.balances.lock().unwrap().get(address).unwrap_or(&0)
    }
}

#[async_trait]
impl WalletBackend for MemoryWallet {
    async fn new_address(&self) -> Result<String, WalletError> {
        Ok(self.next("addr"))
    }

    async fn send_to_address(&self, address: &str, amount: u64) -> Result<String, WalletError> {
        let txid = self.next("tx");
        *self.balances.lock().unwrap().entry(address.to_string()).or_insert(0) += amount;
        let _ = self.events.send(WalletEvent::FundsReceived {
            address: address.to_string(),
            txid: txid.clone(),
            amount,
        });
        Ok(txid)
    }

    async fn broadcast_spend(&self, source_address: &str, package: &SpendPackage) -> Result<String, WalletError> {
        let total: u64 = package.outputs.iter().map(|o| o.amount).sum();
        let txid = self.next("tx");
        {
            let mut balances = self.balances.lock().unwrap();
            let available = balances.get(source_address).copied().unwrap_or(0);
            let required = total + self.release_fee;
            if available < required {
                return Err(WalletError::InsufficientFunds { available, required });
            }
            *balances.get_mut(source_address).unwrap() = available - required;
            for output in &package.outputs {
                *balances.entry(output.address.clone()).or_insert(0) += output.amount;
            }
        }
        for output in &package.outputs {
            let _ = self.events.send(WalletEvent::SpendObserved {
                address: source_address.to_string(),
                txid: txid.clone(),
                destination: output.address.clone(),
                amount: output.amount,
            });
        }
        Ok(txid)
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    fn escrow_release_fee(&self) -> u64 {
        self.release_fee
    }
}

#[cfg(test)]
mod test {
    use agora_key_manager::multisig::{combine_signatures, sign_multisig, RedeemScript, SpendInput, SpendOutput};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;

    #[tokio::test]
    async fn send_emits_funds_received() {
        let wallet = MemoryWallet::new(0);
        let mut events = wallet.subscribe();
        let address = wallet.new_address().await.unwrap();
        let txid = wallet.send_to_address(&address, 500).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), WalletEvent::FundsReceived {
            address: address.clone(),
            txid,
            amount: 500
        });
        assert_eq!(wallet.balance(&address), 500);
    }

    #[tokio::test]
    async fn spend_debits_source_and_emits_observations() {
        let wallet = MemoryWallet::new(10);
        let mut events = wallet.subscribe();

        let a = SigningKey::generate(&mut OsRng);
        let b = SigningKey::generate(&mut OsRng);
        let script = RedeemScript::multisig(2, &[a.verifying_key(), b.verifying_key()]).unwrap();
        let escrow = hex::encode(script.script_hash());
        let funding_txid = wallet.send_to_address(&escrow, 1000).await.unwrap();
        let _ = events.recv().await.unwrap();

        let inputs = vec![SpendInput {
            txid: funding_txid,
            index: 0,
            amount: 1000,
        }];
        let outputs = vec![SpendOutput {
            address: "vendor-payout".to_string(),
            amount: 990,
        }];
        let sig_a = sign_multisig(&a, &script, &inputs, &outputs).unwrap();
        let sig_b = sign_multisig(&b, &script, &inputs, &outputs).unwrap();
        let package = combine_signatures(&script, inputs, outputs, vec![sig_a, sig_b]).unwrap();

        wallet.broadcast_spend(&escrow, &package).await.unwrap();
        assert_eq!(wallet.balance(&escrow), 0);
        assert_eq!(wallet.balance("vendor-payout"), 990);
        match events.recv().await.unwrap() {
            WalletEvent::SpendObserved {
                address, destination, ..
            } => {
                assert_eq!(address, escrow);
                assert_eq!(destination, "vendor-payout");
            },
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn overspend_is_rejected() {
        let wallet = MemoryWallet::new(5);
        let a = SigningKey::generate(&mut OsRng);
        let script = RedeemScript::multisig(1, &[a.verifying_key()]).unwrap();
        let escrow = hex::encode(script.script_hash());
        wallet.send_to_address(&escrow, 100).await.unwrap();

        let inputs = vec![SpendInput {
            txid: "tx-1".to_string(),
            index: 0,
            amount: 100,
        }];
        let outputs = vec![SpendOutput {
            address: "somewhere".to_string(),
            amount: 100,
        }];
        let sigs = sign_multisig(&a, &script, &inputs, &outputs).unwrap();
        let package = combine_signatures(&script, inputs, outputs, vec![sigs]).unwrap();
        // 100 out plus the 5 fee exceeds the 100 funded.
        assert!(matches!(
            wallet.broadcast_spend(&escrow, &package).await,
            Err(WalletError::InsufficientFunds { .. })
        ));
    }
}
