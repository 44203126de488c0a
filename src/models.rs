use serde::{Deserialize, Serialize};
use chrono::{DateTime, SubsecRound, Utc};

// ============================================================================
// Order Aggregate
// ============================================================================
//
// The canonical order shape, shared by the inbound stream payload, the
// durable store and the cache. Field names match the JSON wire format.
//
// Every struct is `#[serde(default)]`: a message with missing fields still
// decodes, and the validator decides whether it is admissible.
//
// Amounts are integers (minor units or literal amounts, as the feed sends
// them). There are no floating-point money fields.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Order {
    pub order_uid: String,
    pub track_number: String,
    pub entry: String,
    pub delivery: Delivery,
    pub payment: Payment,
    pub items: Vec<Item>,
    pub locale: String,
    pub internal_signature: String,
    pub customer_id: String,
    pub delivery_service: String,
    pub shardkey: String,
    pub sm_id: i32,
    /// Unset on the wire is allowed; ingestion stamps it with the current UTC time.
    pub date_created: Option<DateTime<Utc>>,
    pub oof_shard: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Delivery {
    pub name: String,
    pub phone: String,
    pub zip: String,
    pub city: String,
    pub address: String,
    pub region: String,
    pub email: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Payment {
    pub transaction: String,
    pub request_id: String,
    pub currency: String,
    pub provider: String,
    pub amount: i64,
    /// Unix timestamp, seconds.
    pub payment_dt: i64,
    pub bank: String,
    pub delivery_cost: i64,
    pub goods_total: i64,
    pub custom_fee: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Item {
    pub chrt_id: i64,
    pub track_number: String,
    pub price: i64,
    pub rid: String,
    pub name: String,
    /// Discount, percent.
    pub sale: i32,
    pub size: String,
    pub total_price: i64,
    pub nm_id: i64,
    pub brand: String,
    pub status: i32,
}

impl Order {
    /// Stamp `date_created` with `now` if the producer left it unset.
    ///
    /// Called once, where a decoded message becomes a storage candidate. The
    /// timestamp is cut to microseconds, the precision `TIMESTAMPTZ` keeps, so
    /// the cached value matches what a later hydration reads back.
    pub fn normalize(&mut self, now: DateTime<Utc>) {
        let created = self.date_created.unwrap_or(now);
        self.date_created = Some(created.trunc_subsecs(6));
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sample_message_decodes_to_sample_order() {
        let decoded: Order = serde_json::from_str(SAMPLE_MESSAGE).unwrap();
        assert_eq!(decoded, sample_order("b563feb7b2b84b6test"));
    }

    #[test]
    fn test_missing_fields_decode_to_defaults() {
        let decoded: Order = serde_json::from_str(r#"{"order_uid":"x1"}"#).unwrap();
        assert_eq!(decoded.order_uid, "x1");
        assert!(decoded.items.is_empty());
        assert!(decoded.delivery.name.is_empty());
        assert!(decoded.date_created.is_none());
    }

    #[test]
    fn test_normalize_only_fills_unset_date() {
        let now = Utc::now();

        let mut unset = Order::default();
        unset.normalize(now);
        assert_eq!(unset.date_created, Some(now.trunc_subsecs(6)));

        let mut set = sample_order("x2");
        let original = set.date_created;
        set.normalize(now);
        assert_eq!(set.date_created, original);
    }

    #[test]
    fn test_normalize_keeps_microsecond_precision() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 17, 25, 1).unwrap()
            + chrono::Duration::nanoseconds(159_120_486);

        let mut stamped = Order::default();
        stamped.normalize(now);
        assert_eq!(stamped.date_created.unwrap().timestamp_subsec_nanos(), 159_120_000);

        let mut supplied = sample_order("x4");
        supplied.date_created = Some(now);
        supplied.normalize(Utc::now());
        assert_eq!(supplied.date_created.unwrap().timestamp_subsec_nanos(), 159_120_000);
    }

    #[test]
    fn test_wrong_field_type_is_decode_error() {
        let result = serde_json::from_str::<Order>(r#"{"order_uid":"x3","sm_id":"not-a-number"}"#);
        assert!(result.is_err());
    }
}
