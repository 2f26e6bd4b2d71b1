//! Status condition bookkeeping
//!
//! A [`ConditionSet`] describes which condition types a resource reports and
//! how they roll up into the top-level `Ready` condition. Each reconciler owns
//! its own set value; nothing here is global.

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus};

/// Condition type every resource reports
pub const READY: &str = "Ready";

/// Known condition types and their aggregation rule.
///
/// The set is "living": `Ready` is true exactly when every dependent is
/// true, false as soon as any dependent is false, and unknown otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionSet {
    happy: &'static str,
    dependents: Vec<&'static str>,
}

impl ConditionSet {
    /// Create a living set with `Ready` as the happy condition
    pub fn living(dependents: &[&'static str]) -> Self {
        Self {
            happy: READY,
            dependents: dependents.to_vec(),
        }
    }

    /// The happy condition type
    pub fn happy(&self) -> &'static str {
        self.happy
    }

    /// The dependent condition types
    pub fn dependents(&self) -> &[&'static str] {
        &self.dependents
    }

    /// Ensure every known condition is present, adding missing ones as Unknown
    pub fn initialize(&self, conditions: &mut Vec<Condition>) {
        for type_ in std::iter::once(&self.happy).chain(self.dependents.iter()) {
            if find(conditions, type_).is_none() {
                conditions.push(Condition::new(*type_, ConditionStatus::Unknown, "", ""));
            }
        }
        self.recompute(conditions);
    }

    /// Mark a condition True
    pub fn mark_true(&self, conditions: &mut Vec<Condition>, type_: &str) {
        self.set(conditions, type_, ConditionStatus::True, "", "");
    }

    /// Mark a condition False with a reason and message
    pub fn mark_false(
        &self,
        conditions: &mut Vec<Condition>,
        type_: &str,
        reason: &str,
        message: &str,
    ) {
        self.set(conditions, type_, ConditionStatus::False, reason, message);
    }

    /// Mark a condition Unknown with a reason and message
    pub fn mark_unknown(
        &self,
        conditions: &mut Vec<Condition>,
        type_: &str,
        reason: &str,
        message: &str,
    ) {
        self.set(conditions, type_, ConditionStatus::Unknown, reason, message);
    }

    /// Whether the happy condition is True
    pub fn is_happy(&self, conditions: &[Condition]) -> bool {
        find(conditions, self.happy).is_some_and(|c| c.status == ConditionStatus::True)
    }

    fn set(
        &self,
        conditions: &mut Vec<Condition>,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        upsert(conditions, type_, status, reason, message);
        if type_ != self.happy {
            self.recompute(conditions);
        }
    }

    fn recompute(&self, conditions: &mut Vec<Condition>) {
        if self.dependents.is_empty() {
            return;
        }

        let mut happy = (ConditionStatus::True, String::new(), String::new());
        for dependent in &self.dependents {
            let (status, reason, message) = match find(conditions, dependent) {
                Some(c) => (c.status.clone(), c.reason.clone(), c.message.clone()),
                None => (ConditionStatus::Unknown, String::new(), String::new()),
            };
            match status {
                ConditionStatus::False => {
                    happy = (ConditionStatus::False, reason, message);
                    break;
                }
                ConditionStatus::Unknown if happy.0 == ConditionStatus::True => {
                    happy = (ConditionStatus::Unknown, reason, message);
                }
                _ => {}
            }
        }

        let (status, reason, message) = happy;
        upsert(conditions, self.happy, status, &reason, &message);
    }
}

/// Find a condition by type
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or update a condition, keeping the transition time when the status is unchanged
fn upsert(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => conditions.push(Condition::new(type_, status, reason, message)),
    }
}
