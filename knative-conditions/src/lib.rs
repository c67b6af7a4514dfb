//! Status conditions for Knative-style resources.
//!
//! A resource declares a [`ConditionType`]: one happy variant (`Ready` or `Succeeded`) plus the
//! dependents that determine it. [`ConditionManager`] keeps the happy [`Condition`] in step with
//! its dependents every time one of them is marked.
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// Enums that implement [`ConditionType`] can be used to differentiate [`Condition`]
/// and describe the state of the resource.
pub trait ConditionType: Clone + Copy + Default + Debug + PartialEq + 'static {
    /// The top-level variant that determines overall readiness of the resource.
    fn happy() -> Self;
    /// Variants that must be true to consider the happy condition true, in declaration order.
    fn dependents() -> &'static [Self];
    /// The declared severity of this variant.
    ///
    /// The happy condition and dependents are [`ConditionSeverity::Error`] unless overridden,
    /// every other variant is advisory.
    fn severity(&self) -> ConditionSeverity {
        if *self == Self::happy() || Self::dependents().contains(self) {
            ConditionSeverity::Error
        } else {
            ConditionSeverity::Warning
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionSetError {
    #[error("happy condition {0} may not also be a dependent")]
    HappyIsDependent(String),
    #[error("dependent condition {0} is declared more than once")]
    DuplicateDependent(String),
    #[error("happy condition {0} must have Error severity")]
    HappySeverity(String),
}

/// Defines how the variants of a [`ConditionType`] depend on one another.
#[derive(Debug, Clone, Copy)]
pub struct ConditionSet<C: ConditionType> {
    happy: C,
    dependents: &'static [C],
}

impl<C: ConditionType> ConditionSet<C> {
    /// Validate the declared schema. Controllers call this once at startup so that a malformed
    /// [`ConditionType`] stops the process before any object is reconciled.
    pub fn try_new() -> Result<Self, ConditionSetError> {
        let happy = C::happy();
        let dependents = C::dependents();

        if dependents.contains(&happy) {
            return Err(ConditionSetError::HappyIsDependent(format!("{:?}", happy)));
        }
        if !happy.severity().is_err() {
            return Err(ConditionSetError::HappySeverity(format!("{:?}", happy)));
        }
        for (i, dependent) in dependents.iter().enumerate() {
            if dependents[..i].contains(dependent) {
                return Err(ConditionSetError::DuplicateDependent(format!("{:?}", dependent)));
            }
        }

        Ok(ConditionSet { happy, dependents })
    }

    /// ### Panic
    /// *Panics* if the [`ConditionType`] is malformed, see [`ConditionSet::try_new`].
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(set) => set,
            Err(err) => panic!("invalid condition set: {}", err),
        }
    }

    pub fn happy(&self) -> C {
        self.happy
    }

    pub fn dependents(&self) -> &'static [C] {
        self.dependents
    }

    /// Whether the [`ConditionType`] determines happiness.
    pub fn is_terminal(&self, condition_type: &C) -> bool {
        self.dependents.contains(condition_type) || self.happy == *condition_type
    }

    /// Compute the happy [`Condition`] from the current dependents.
    ///
    /// The first `False` Error-severity dependent in declaration order wins, otherwise the first
    /// `Unknown` or missing one, otherwise the happy condition is `True`. A dependent's recorded
    /// severity takes precedence over its declared severity. The returned condition carries no
    /// transition time; [`Conditions::set_cond`] assigns one.
    pub fn recompute(&self, conditions: &Conditions<C>) -> Condition<C> {
        let mut unknown: Option<Condition<C>> = None;

        for dependent in self.dependents {
            match conditions.get_cond(dependent) {
                Some(cond) if !cond.severity.is_err() => continue,
                Some(cond) if cond.is_false() => {
                    return self.happy_from(ConditionStatus::False, cond);
                }
                Some(cond) if cond.is_unknown() => {
                    if unknown.is_none() {
                        unknown = Some(self.happy_from(ConditionStatus::Unknown, cond));
                    }
                }
                Some(_) => {}
                None if dependent.severity().is_err() => {
                    if unknown.is_none() {
                        unknown = Some(Condition {
                            type_: self.happy,
                            status: ConditionStatus::Unknown,
                            severity: ConditionSeverity::Error,
                            last_transition_time: None,
                            reason: None,
                            message: Some(format!("{:?} has not been reported", dependent)),
                        });
                    }
                }
                None => {}
            }
        }

        unknown.unwrap_or_else(|| Condition::new(self.happy).with_status(ConditionStatus::True))
    }

    fn happy_from(&self, status: ConditionStatus, dependent: &Condition<C>) -> Condition<C> {
        Condition {
            type_: self.happy,
            status,
            severity: ConditionSeverity::Error,
            last_transition_time: None,
            reason: dependent.reason.clone(),
            message: dependent.message.clone(),
        }
    }
}

impl<C: ConditionType> Default for ConditionSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// The importance of a conditions status.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    Error,
    Warning,
}

impl ConditionSeverity {
    pub fn is_err(&self) -> bool {
        *self == ConditionSeverity::Error
    }
}

impl Default for ConditionSeverity {
    // A condition without a recorded severity blocks readiness.
    fn default() -> Self {
        ConditionSeverity::Error
    }
}

/// A [`Vec`] of [`Condition`] that maintains transition times.
///
/// At most one condition exists per type. Order is insertion order, which keeps serialized
/// status stable across passes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Conditions<C>(Vec<Condition<C>>)
where
    C: ConditionType;

impl<C: ConditionType> Default for Conditions<C> {
    fn default() -> Self {
        let now = Utc::now();
        let iter = [C::happy()]
            .into_iter()
            .chain(C::dependents().iter().copied())
            .map(|type_| Condition {
                last_transition_time: Some(now),
                ..Condition::new(type_)
            });
        Conditions(Vec::from_iter(iter))
    }
}

impl<C: ConditionType> Conditions<C> {
    pub fn with_conditions(conditions: Vec<Condition<C>>) -> Conditions<C> {
        let mut out = Conditions(Vec::with_capacity(conditions.len()));
        // keep the last entry for a duplicated type
        for condition in conditions {
            match out.get_cond_mut(&condition.type_) {
                Some(existing) => *existing = condition,
                None => out.0.push(condition),
            }
        }
        out
    }

    pub fn get_cond(&self, type_: &C) -> Option<&Condition<C>> {
        self.0.iter().find(|c| c.type_ == *type_)
    }

    fn get_cond_mut(&mut self, type_: &C) -> Option<&mut Condition<C>> {
        self.0.iter_mut().find(|c| c.type_ == *type_)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Condition<C>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Store `condition`, returning whether anything changed.
    pub fn set_cond(&mut self, condition: Condition<C>) -> bool {
        self.set_cond_at(condition, Utc::now())
    }

    /// Store `condition` as observed at `now`.
    ///
    /// `lastTransitionTime` moves only when `status` changes. A different reason, message or
    /// severity at the same status updates the content and keeps the previous time.
    pub fn set_cond_at(&mut self, condition: Condition<C>, now: DateTime<Utc>) -> bool {
        match self.get_cond_mut(&condition.type_) {
            Some(cond) if cond.status == condition.status => {
                if cond.reason == condition.reason
                    && cond.message == condition.message
                    && cond.severity == condition.severity
                {
                    return false;
                }
                cond.reason = condition.reason;
                cond.message = condition.message;
                cond.severity = condition.severity;
                if cond.last_transition_time.is_none() {
                    cond.last_transition_time = Some(now);
                }
                true
            }
            Some(cond) => {
                *cond = Condition {
                    last_transition_time: Some(now),
                    ..condition
                };
                true
            }
            None => {
                self.0.push(Condition {
                    last_transition_time: Some(now),
                    ..condition
                });
                true
            }
        }
    }
}

impl<'a, C: ConditionType> IntoIterator for &'a Conditions<C> {
    type Item = &'a Condition<C>;
    type IntoIter = std::slice::Iter<'a, Condition<C>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A custom resource status condition.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition<C: ConditionType> {
    #[serde(rename = "type")]
    pub type_: C,
    pub status: ConditionStatus,
    /// Whether a failure of this condition should be viewed as an error.
    /// Missing on input means [`ConditionSeverity::Error`].
    #[serde(default)]
    pub severity: ConditionSeverity,
    /// Set when `status` last changed. Reason and message edits leave it alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<C: ConditionType> Default for Condition<C> {
    fn default() -> Condition<C> {
        Condition::new(C::default())
    }
}

impl<C: ConditionType> Condition<C> {
    /// An `Unknown` condition of `type_` with its declared severity.
    pub fn new(type_: C) -> Self {
        Condition {
            type_,
            status: ConditionStatus::Unknown,
            severity: type_.severity(),
            last_transition_time: None,
            reason: None,
            message: None,
        }
    }

    fn with_status(self, status: ConditionStatus) -> Self {
        Condition { status, ..self }
    }

    fn with_reason(self, reason: &str, message: Option<String>) -> Self {
        Condition {
            reason: Some(reason.to_string()),
            message,
            ..self
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }

    pub fn is_unknown(&self) -> bool {
        self.status == ConditionStatus::Unknown
    }
}

/// The state of a [`Condition`].
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        ConditionStatus::Unknown
    }
}

/// Provides [`ConditionManager`] access to the [`Conditions`],
/// and exposes control of the top-level [`Condition`].
pub trait ConditionAccessor<C: ConditionType> {
    /// Return the conditions of your CR status type.
    fn conditions(&mut self) -> &mut Conditions<C>;

    /// Returns a [`ConditionManager`] for more fine-grained control of [`Conditions`].
    fn manager(&mut self) -> ConditionManager<'_, C> {
        ConditionManager::new(self.conditions())
    }

    /// Returns true if the resource is ready overall.
    fn is_ready(&mut self) -> bool {
        self.manager().is_happy()
    }

    /// Set the status of the top level condition type to false
    fn mark_false(&mut self, reason: &str, message: Option<String>) {
        self.manager().mark_false(C::happy(), reason, message);
    }

    /// Set the status of the top level condition to unknown. Typically used when beginning the
    /// reconciliation of a new generation.
    fn mark_unknown(&mut self) {
        self.manager().mark_unknown(
            C::happy(),
            "NewObservedGenFailure",
            Some("unsuccessfully observed a new generation".into()),
        );
    }

    fn mark_unknown_with_message(&mut self, reason: &str, message: Option<String>) {
        self.manager().mark_unknown(C::happy(), reason, message);
    }
}

impl<C: ConditionType> ConditionAccessor<C> for Conditions<C> {
    fn conditions(&mut self) -> &mut Conditions<C> {
        self
    }
}

/// Mutates [`Conditions`] in accordance with the condition dependency chain defined by a
/// [`ConditionType`].
pub struct ConditionManager<'a, C>
where
    C: ConditionType,
{
    set: ConditionSet<C>,
    conditions: &'a mut Conditions<C>,
}

impl<'a, C> ConditionManager<'a, C>
where
    C: ConditionType,
{
    pub fn new(conditions: &'a mut Conditions<C>) -> Self {
        ConditionManager {
            set: ConditionSet::new(),
            conditions,
        }
    }

    pub fn with_set(set: ConditionSet<C>, conditions: &'a mut Conditions<C>) -> Self {
        ConditionManager { set, conditions }
    }

    pub fn get_condition(&self, condition_type: C) -> Option<&Condition<C>> {
        self.conditions.get_cond(&condition_type)
    }

    /// Returns the happy [`Condition`], if it has been recorded.
    pub fn get_top_level_condition(&self) -> Option<&Condition<C>> {
        self.get_condition(self.set.happy)
    }

    pub fn is_happy(&self) -> bool {
        self.get_top_level_condition()
            .map(Condition::is_true)
            .unwrap_or(false)
    }

    /// Store `condition` and bring the happy condition up to date in the same pass.
    ///
    /// Setting the happy condition itself bypasses recomputation.
    pub fn set_condition(&mut self, condition: Condition<C>) {
        let is_happy = condition.type_ == self.set.happy;
        self.conditions.set_cond(condition);
        if !is_happy {
            self.recompute_happiness();
        }
    }

    /// Re-evaluate the happy condition from the current dependents.
    pub fn recompute_happiness(&mut self) {
        let happy = self.set.recompute(&*self.conditions);
        self.conditions.set_cond(happy);
    }

    pub fn mark_true(&mut self, condition_type: C) {
        self.set_condition(Condition::new(condition_type).with_status(ConditionStatus::True));
    }

    pub fn mark_true_with_reason(&mut self, condition_type: C, reason: &str, message: Option<String>) {
        self.set_condition(
            Condition::new(condition_type)
                .with_status(ConditionStatus::True)
                .with_reason(reason, message),
        );
    }

    /// Set the status of the condition type to false. The happy condition follows if this
    /// condition is an Error-severity dependent.
    pub fn mark_false(&mut self, condition_type: C, reason: &str, message: Option<String>) {
        self.set_condition(
            Condition::new(condition_type)
                .with_status(ConditionStatus::False)
                .with_reason(reason, message),
        );
    }

    /// Set the status to unknown. The happy condition becomes unknown too unless another
    /// dependent is already false.
    pub fn mark_unknown(&mut self, condition_type: C, reason: &str, message: Option<String>) {
        self.set_condition(
            Condition::new(condition_type)
                .with_status(ConditionStatus::Unknown)
                .with_reason(reason, message),
        );
    }
}
