//! Merging partial updates into an article
use super::*;
use std::fmt;

/// One changed field, rendered as `field: old -> new`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub old: String,
    pub new: String,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.old, self.new)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Described changes; silent fields (the auction state) don't show up here
    pub changes: Vec<FieldChange>,
    pub changed: bool,
}

impl MergeOutcome {
    fn record<T: Serialize>(&mut self, field: &str, old: &T, new: &T) {
        self.changed = true;
        self.changes.push(FieldChange {
            field: field.to_owned(),
            old: describe(old),
            new: describe(new),
        });
    }

    pub fn describe(&self) -> String {
        self.changes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn describe<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "?".to_owned(),
    }
}

fn merge_opt<T>(outcome: &mut MergeOutcome, field: &str, target: &mut Option<T>, new: &Option<T>)
where
    T: PartialEq + Clone + Serialize,
{
    if let Some(new) = new {
        if target.as_ref() != Some(new) {
            let new = Some(new.clone());
            outcome.record(field, &*target, &new);
            *target = new;
        }
    }
}

/// Merge `new` into `old`: objects are merged key by key (only keys
/// present in `new`), everything else is replaced.
///
/// Returns the paths of changed leaves.
pub fn merge_value(path: &str, old: &mut Value, new: &Value) -> Vec<FieldChange> {
    let mut changes = vec![];
    merge_value_into(path, old, new, &mut changes);
    changes
}

fn merge_value_into(path: &str, old: &mut Value, new: &Value, changes: &mut Vec<FieldChange>) {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, new_value) in new {
                let path = format!("{}.{}", path, key);
                let old_value = old.entry(key.clone()).or_insert(Value::Null);
                merge_value_into(&path, old_value, new_value, changes);
            }
        }
        (old, new) => {
            if old != new {
                changes.push(FieldChange {
                    field: path.to_owned(),
                    old: old.to_string(),
                    new: new.to_string(),
                });
                *old = new.clone();
            }
        }
    }
}

impl ArticleRecord {
    /// Apply `update`, re-clamp the max bid and report what changed
    pub fn merge(&mut self, update: &ArticleUpdate) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        merge_opt(&mut outcome, "articleEndTime", &mut self.end_time_ms, &update.end_time_ms);
        merge_opt(&mut outcome, "articleBidPrice", &mut self.bid_price, &update.bid_price);
        merge_opt(&mut outcome, "articleBuyPrice", &mut self.buy_price, &update.buy_price);
        merge_opt(&mut outcome, "articleBidCount", &mut self.bid_count, &update.bid_count);
        merge_opt(&mut outcome, "articleMinimumBid", &mut self.minimum_bid, &update.minimum_bid);
        merge_opt(&mut outcome, "articleShippingCost", &mut self.shipping_cost, &update.shipping_cost);
        merge_opt(&mut outcome, "articleCurrency", &mut self.currency, &update.currency);
        merge_opt(&mut outcome, "articleDescription", &mut self.description, &update.description);

        // applied, but too verbose to describe
        if let Some(new_state) = &update.auction_state {
            let state = self.auction_state.get_or_insert(Value::Null);
            if !merge_value("articleAuctionState", state, new_state).is_empty() {
                outcome.changed = true;
            }
        }

        if let Some(group) = &update.group {
            if &self.group != group {
                outcome.record("articleGroup", &self.group, group);
                self.group = group.clone();
            }
        }

        if let Some(auto_bid) = update.auto_bid {
            if self.auto_bid != auto_bid {
                outcome.record("articleAutoBid", &self.auto_bid, &auto_bid);
                self.auto_bid = auto_bid;
            }
        }

        // limits may have moved even when the max bid itself didn't
        let old_max_bid = self.max_bid;
        if let Some(max_bid) = update.max_bid {
            self.max_bid = max_bid;
        }
        self.clamp_max_bid();
        if self.max_bid != old_max_bid {
            outcome.record("articleMaxBid", &old_max_bid, &self.max_bid);
        }

        outcome
    }
}
