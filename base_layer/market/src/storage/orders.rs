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

use agora_comms::node_id::NodeId;
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, SqliteConnection};

use super::MarketStorageError;
use crate::schema::{cases, order_transactions, orders, refunds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OrderRole {
    Buyer = 0,
    Vendor = 1,
    Moderator = 2,
}

impl TryFrom<i32> for OrderRole {
    type Error = MarketStorageError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OrderRole::Buyer),
            1 => Ok(OrderRole::Vendor),
            2 => Ok(OrderRole::Moderator),
            v => Err(MarketStorageError::ConversionError(format!("invalid order role {}", v))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OrderState {
    AwaitingPayment = 0,
    Funded = 1,
    Confirmed = 2,
    Fulfilled = 3,
    Completed = 4,
    Canceled = 5,
    Rejected = 6,
    Refunded = 7,
    Disputed = 8,
    Resolved = 9,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        use OrderState::*;
        matches!(self, Completed | Canceled | Rejected | Refunded | Resolved)
    }
}

impl TryFrom<i32> for OrderState {
    type Error = MarketStorageError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        use OrderState::*;
        match value {
            0 => Ok(AwaitingPayment),
            1 => Ok(Funded),
            2 => Ok(Confirmed),
            3 => Ok(Fulfilled),
            4 => Ok(Completed),
            5 => Ok(Canceled),
            6 => Ok(Rejected),
            7 => Ok(Refunded),
            8 => Ok(Disputed),
            9 => Ok(Resolved),
            v => Err(MarketStorageError::ConversionError(format!("invalid order state {}", v))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PaymentMethod {
    /// Straight to a vendor-controlled address, no escrow.
    Direct = 0,
    /// 1-of-2 multisig between buyer and vendor; either can move the funds.
    Cancelable = 1,
    /// 2-of-3 multisig with a moderator, optionally time-locked.
    Moderated = 2,
}

impl TryFrom<i32> for PaymentMethod {
    type Error = MarketStorageError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PaymentMethod::Direct),
            1 => Ok(PaymentMethod::Cancelable),
            2 => Ok(PaymentMethod::Moderated),
            v => Err(MarketStorageError::ConversionError(format!(
                "invalid payment method {}",
                v
            ))),
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = orders)]
pub struct OrderSql {
    pub order_id: String,
    pub role: i32,
    pub state: i32,
    pub payment_method: i32,
    pub buyer: String,
    pub vendor: String,
    pub moderator: Option<String>,
    pub payment_address: Option<String>,
    pub payment_amount: i64,
    pub chaincode: Vec<u8>,
    pub contract: Vec<u8>,
    pub confirmation: Option<Vec<u8>>,
    pub fulfillment: Option<Vec<u8>>,
    pub completion: Option<Vec<u8>>,
    pub rejection: Option<Vec<u8>>,
    pub cancellation: Option<Vec<u8>>,
    pub payment_finalized: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl OrderSql {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: String,
        role: OrderRole,
        payment_method: PaymentMethod,
        buyer: &NodeId,
        vendor: &NodeId,
        moderator: Option<&NodeId>,
        payment_amount: u64,
        chaincode: Vec<u8>,
        contract: Vec<u8>,
    ) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            order_id,
            role: role as i32,
            state: OrderState::AwaitingPayment as i32,
            payment_method: payment_method as i32,
            buyer: buyer.to_string(),
            vendor: vendor.to_string(),
            moderator: moderator.map(|m| m.to_string()),
            payment_address: None,
            payment_amount: payment_amount as i64,
            chaincode,
            contract,
            confirmation: None,
            fulfillment: None,
            completion: None,
            rejection: None,
            cancellation: None,
            payment_finalized: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<(), MarketStorageError> {
        diesel::insert_into(orders::table).values(self).execute(conn)?;
        Ok(())
    }

    pub fn find(conn: &mut SqliteConnection, order_id: &str) -> Result<Option<Self>, MarketStorageError> {
        Ok(orders::table
            .filter(orders::order_id.eq(order_id))
            .first::<Self>(conn)
            .optional()?)
    }

    pub fn state(&self) -> Result<OrderState, MarketStorageError> {
        OrderState::try_from(self.state)
    }

    pub fn role(&self) -> Result<OrderRole, MarketStorageError> {
        OrderRole::try_from(self.role)
    }

    pub fn payment_method(&self) -> Result<PaymentMethod, MarketStorageError> {
        PaymentMethod::try_from(self.payment_method)
    }

    pub fn buyer_node_id(&self) -> Result<NodeId, MarketStorageError> {
        self.buyer
            .parse()
            .map_err(|_| MarketStorageError::ConversionError(format!("bad buyer id {}", self.buyer)))
    }

    pub fn vendor_node_id(&self) -> Result<NodeId, MarketStorageError> {
        self.vendor
            .parse()
            .map_err(|_| MarketStorageError::ConversionError(format!("bad vendor id {}", self.vendor)))
    }

    pub fn set_state(conn: &mut SqliteConnection, order_id: &str, state: OrderState) -> Result<(), MarketStorageError> {
        let n = diesel::update(orders::table.filter(orders::order_id.eq(order_id)))
            .set((orders::state.eq(state as i32), orders::updated_at.eq(Utc::now().naive_utc())))
            .execute(conn)?;
        if n == 0 {
            return Err(MarketStorageError::NotFound);
        }
        Ok(())
    }

    pub fn set_payment_address(
        conn: &mut SqliteConnection,
        order_id: &str,
        address: &str,
    ) -> Result<(), MarketStorageError> {
        diesel::update(orders::table.filter(orders::order_id.eq(order_id)))
            .set((
                orders::payment_address.eq(address),
                orders::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_confirmation(
        conn: &mut SqliteConnection,
        order_id: &str,
        payload: &[u8],
    ) -> Result<(), MarketStorageError> {
        diesel::update(orders::table.filter(orders::order_id.eq(order_id)))
            .set((
                orders::confirmation.eq(payload),
                orders::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_fulfillment(
        conn: &mut SqliteConnection,
        order_id: &str,
        payload: &[u8],
    ) -> Result<(), MarketStorageError> {
        diesel::update(orders::table.filter(orders::order_id.eq(order_id)))
            .set((
                orders::fulfillment.eq(payload),
                orders::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_completion(
        conn: &mut SqliteConnection,
        order_id: &str,
        payload: &[u8],
    ) -> Result<(), MarketStorageError> {
        diesel::update(orders::table.filter(orders::order_id.eq(order_id)))
            .set((
                orders::completion.eq(payload),
                orders::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_rejection(conn: &mut SqliteConnection, order_id: &str, payload: &[u8]) -> Result<(), MarketStorageError> {
        diesel::update(orders::table.filter(orders::order_id.eq(order_id)))
            .set((
                orders::rejection.eq(payload),
                orders::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_cancellation(
        conn: &mut SqliteConnection,
        order_id: &str,
        payload: &[u8],
    ) -> Result<(), MarketStorageError> {
        diesel::update(orders::table.filter(orders::order_id.eq(order_id)))
            .set((
                orders::cancellation.eq(payload),
                orders::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_payment_finalized(conn: &mut SqliteConnection, order_id: &str) -> Result<(), MarketStorageError> {
        diesel::update(orders::table.filter(orders::order_id.eq(order_id)))
            .set((
                orders::payment_finalized.eq(true),
                orders::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn find_by_payment_address(
        conn: &mut SqliteConnection,
        address: &str,
    ) -> Result<Option<Self>, MarketStorageError> {
        Ok(orders::table
            .filter(orders::payment_address.eq(address))
            .first::<Self>(conn)
            .optional()?)
    }
}

/// On-chain transactions observed against an order's payment address. Funding
/// rows add to the balance; spend rows record escrow releases (and settle the
/// cancel/confirm race on cancelable orders).
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = order_transactions)]
pub struct OrderTransactionSql {
    pub txid: String,
    pub order_id: String,
    pub amount: i64,
    pub is_spend: bool,
    pub destination: Option<String>,
    pub observed_at: NaiveDateTime,
}

impl OrderTransactionSql {
    pub fn record(
        conn: &mut SqliteConnection,
        order_id: &str,
        txid: &str,
        amount: u64,
        is_spend: bool,
        destination: Option<&str>,
    ) -> Result<(), MarketStorageError> {
        diesel::insert_or_ignore_into(order_transactions::table)
            .values(&OrderTransactionSql {
                txid: txid.to_string(),
                order_id: order_id.to_string(),
                amount: amount as i64,
                is_spend,
                destination: destination.map(|d| d.to_string()),
                observed_at: Utc::now().naive_utc(),
            })
            .execute(conn)?;
        Ok(())
    }

    pub fn for_order(conn: &mut SqliteConnection, order_id: &str) -> Result<Vec<Self>, MarketStorageError> {
        Ok(order_transactions::table
            .filter(order_transactions::order_id.eq(order_id))
            .order(order_transactions::observed_at.asc())
            .load::<Self>(conn)?)
    }

    /// Total observed funding (spends excluded).
    pub fn funding_total(conn: &mut SqliteConnection, order_id: &str) -> Result<u64, MarketStorageError> {
        let rows = Self::for_order(conn, order_id)?;
        Ok(rows.iter().filter(|r| !r.is_spend).map(|r| r.amount as u64).sum())
    }

    pub fn fundings(conn: &mut SqliteConnection, order_id: &str) -> Result<Vec<Self>, MarketStorageError> {
        Ok(Self::for_order(conn, order_id)?.into_iter().filter(|r| !r.is_spend).collect())
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = refunds)]
pub struct RefundSql {
    pub id: i32,
    pub order_id: String,
    pub funding_txid: String,
    pub amount: i64,
    pub refund_address: String,
    pub refunded_at: NaiveDateTime,
}

impl RefundSql {
    pub fn record(
        conn: &mut SqliteConnection,
        order_id: &str,
        funding_txid: &str,
        amount: u64,
        refund_address: &str,
    ) -> Result<(), MarketStorageError> {
        diesel::insert_into(refunds::table)
            .values((
                refunds::order_id.eq(order_id),
                refunds::funding_txid.eq(funding_txid),
                refunds::amount.eq(amount as i64),
                refunds::refund_address.eq(refund_address),
                refunds::refunded_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn for_order(conn: &mut SqliteConnection, order_id: &str) -> Result<Vec<Self>, MarketStorageError> {
        Ok(refunds::table
            .filter(refunds::order_id.eq(order_id))
            .order(refunds::refunded_at.asc())
            .load::<Self>(conn)?)
    }

    pub fn total_refunded(conn: &mut SqliteConnection, order_id: &str) -> Result<u64, MarketStorageError> {
        Ok(Self::for_order(conn, order_id)?.iter().map(|r| r.amount as u64).sum())
    }

    /// Refunds already issued against one funding transaction.
    pub fn refunded_for_funding(
        conn: &mut SqliteConnection,
        order_id: &str,
        funding_txid: &str,
    ) -> Result<u64, MarketStorageError> {
        Ok(Self::for_order(conn, order_id)?
            .iter()
            .filter(|r| r.funding_txid == funding_txid)
            .map(|r| r.amount as u64)
            .sum())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CaseState {
    Open = 0,
    Closed = 1,
}

impl TryFrom<i32> for CaseState {
    type Error = MarketStorageError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CaseState::Open),
            1 => Ok(CaseState::Closed),
            v => Err(MarketStorageError::ConversionError(format!("invalid case state {}", v))),
        }
    }
}

/// A dispute case. The case id is the order id; both parties' contracts are kept
/// so a moderator can compare them.
#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = cases)]
pub struct CaseSql {
    pub case_id: String,
    pub opened_by: i32,
    pub claim: String,
    pub buyer_peer: Option<String>,
    pub vendor_peer: Option<String>,
    pub buyer_contract: Option<Vec<u8>>,
    pub vendor_contract: Option<Vec<u8>>,
    pub state: i32,
    pub resolution: Option<String>,
    pub opened_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl CaseSql {
    pub fn open(
        conn: &mut SqliteConnection,
        case_id: &str,
        opened_by: OrderRole,
        claim: &str,
    ) -> Result<(), MarketStorageError> {
        let now = Utc::now().naive_utc();
        diesel::insert_or_ignore_into(cases::table)
            .values((
                cases::case_id.eq(case_id),
                cases::opened_by.eq(opened_by as i32),
                cases::claim.eq(claim),
                cases::state.eq(CaseState::Open as i32),
                cases::opened_at.eq(now),
                cases::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn find(conn: &mut SqliteConnection, case_id: &str) -> Result<Option<Self>, MarketStorageError> {
        Ok(cases::table
            .filter(cases::case_id.eq(case_id))
            .first::<Self>(conn)
            .optional()?)
    }

    /// Records the node id a party's messages arrived from, so a moderator who
    /// holds no order record can still address the closing decision.
    pub fn set_party(
        conn: &mut SqliteConnection,
        case_id: &str,
        role: OrderRole,
        peer: &NodeId,
    ) -> Result<(), MarketStorageError> {
        let now = Utc::now().naive_utc();
        match role {
            OrderRole::Buyer => {
                diesel::update(cases::table.filter(cases::case_id.eq(case_id)))
                    .set((cases::buyer_peer.eq(peer.to_string()), cases::updated_at.eq(now)))
                    .execute(conn)?;
            },
            OrderRole::Vendor => {
                diesel::update(cases::table.filter(cases::case_id.eq(case_id)))
                    .set((cases::vendor_peer.eq(peer.to_string()), cases::updated_at.eq(now)))
                    .execute(conn)?;
            },
            OrderRole::Moderator => {
                return Err(MarketStorageError::ConversionError(
                    "a case party must be a buyer or a vendor".to_string(),
                ));
            },
        }
        Ok(())
    }

    pub fn set_buyer_contract(
        conn: &mut SqliteConnection,
        case_id: &str,
        contract: &[u8],
    ) -> Result<(), MarketStorageError> {
        diesel::update(cases::table.filter(cases::case_id.eq(case_id)))
            .set((cases::buyer_contract.eq(contract), cases::updated_at.eq(Utc::now().naive_utc())))
            .execute(conn)?;
        Ok(())
    }

    pub fn set_vendor_contract(
        conn: &mut SqliteConnection,
        case_id: &str,
        contract: &[u8],
    ) -> Result<(), MarketStorageError> {
        diesel::update(cases::table.filter(cases::case_id.eq(case_id)))
            .set((cases::vendor_contract.eq(contract), cases::updated_at.eq(Utc::now().naive_utc())))
            .execute(conn)?;
        Ok(())
    }

    pub fn close(conn: &mut SqliteConnection, case_id: &str, resolution: &str) -> Result<(), MarketStorageError> {
        diesel::update(cases::table.filter(cases::case_id.eq(case_id)))
            .set((
                cases::state.eq(CaseState::Closed as i32),
                cases::resolution.eq(resolution),
                cases::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use agora_comms::node_identity::NodeIdentity;
    use agora_common_sqlite::connection::DbConnectionUrl;

    use super::*;
    use crate::storage::MarketDatabase;

    fn test_db() -> MarketDatabase {
        let url = DbConnectionUrl::memory(agora_test_utils::random::string(12));
        MarketDatabase::connect(&url).unwrap()
    }

    fn sample_order(order_id: &str, buyer: &NodeId, vendor: &NodeId) -> OrderSql {
        OrderSql::new(
            order_id.to_string(),
            OrderRole::Buyer,
            PaymentMethod::Moderated,
            buyer,
            vendor,
            None,
            10_000,
            vec![7; 32],
            b"contract".to_vec(),
        )
    }

    #[test]
    fn order_lifecycle_fields() {
        let db = test_db();
        let buyer = NodeIdentity::random().node_id();
        let vendor = NodeIdentity::random().node_id();
        db.with_connection(|conn| {
            sample_order("order-1", &buyer, &vendor).insert(conn)?;
            let order = OrderSql::find(conn, "order-1")?.unwrap();
            assert_eq!(order.state()?, OrderState::AwaitingPayment);
            assert_eq!(order.payment_method()?, PaymentMethod::Moderated);

            OrderSql::set_payment_address(conn, "order-1", "addr-1")?;
            OrderSql::set_confirmation(conn, "order-1", b"conf")?;
            OrderSql::set_state(conn, "order-1", OrderState::Confirmed)?;
            let order = OrderSql::find(conn, "order-1")?.unwrap();
            assert_eq!(order.state()?, OrderState::Confirmed);
            assert_eq!(order.confirmation.as_deref(), Some(b"conf".as_slice()));
            assert!(OrderSql::find_by_payment_address(conn, "addr-1")?.is_some());

            assert!(matches!(
                OrderSql::set_state(conn, "missing", OrderState::Funded),
                Err(MarketStorageError::NotFound)
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn funding_and_refund_totals() {
        let db = test_db();
        let buyer = NodeIdentity::random().node_id();
        let vendor = NodeIdentity::random().node_id();
        db.with_connection(|conn| {
            sample_order("order-2", &buyer, &vendor).insert(conn)?;
            OrderTransactionSql::record(conn, "order-2", "tx-1", 10_000, false, None)?;
            OrderTransactionSql::record(conn, "order-2", "tx-1", 10_000, false, None)?;
            OrderTransactionSql::record(conn, "order-2", "tx-2", 222_222, false, None)?;
            OrderTransactionSql::record(conn, "order-2", "tx-3", 9_900, true, Some("refund-addr"))?;
            assert_eq!(OrderTransactionSql::funding_total(conn, "order-2")?, 232_222);
            assert_eq!(OrderTransactionSql::fundings(conn, "order-2")?.len(), 2);

            RefundSql::record(conn, "order-2", "tx-1", 9_900, "refund-addr")?;
            RefundSql::record(conn, "order-2", "tx-2", 222_122, "refund-addr")?;
            assert_eq!(RefundSql::total_refunded(conn, "order-2")?, 232_022);
            assert_eq!(RefundSql::refunded_for_funding(conn, "order-2", "tx-1")?, 9_900);
            assert_eq!(RefundSql::for_order(conn, "order-2")?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn case_open_and_close() {
        let db = test_db();
        db.with_connection(|conn| {
            let buyer = NodeIdentity::random().node_id();
            CaseSql::open(conn, "order-3", OrderRole::Buyer, "never arrived")?;
            CaseSql::set_buyer_contract(conn, "order-3", b"buyer-contract")?;
            CaseSql::set_party(conn, "order-3", OrderRole::Buyer, &buyer)?;
            let case = CaseSql::find(conn, "order-3")?.unwrap();
            assert_eq!(CaseState::try_from(case.state)?, CaseState::Open);
            assert_eq!(case.buyer_peer.as_deref(), Some(buyer.to_string().as_str()));
            assert!(case.vendor_peer.is_none());
            CaseSql::close(conn, "order-3", "refund the buyer")?;
            let case = CaseSql::find(conn, "order-3")?.unwrap();
            assert_eq!(CaseState::try_from(case.state)?, CaseState::Closed);
            assert_eq!(case.resolution.as_deref(), Some("refund the buyer"));
            Ok(())
        })
        .unwrap();
    }
}
