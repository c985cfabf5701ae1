//! Reactive form-state engine
//!
//! - **[`Store`]** - One form: values, field states, registrations, lifecycle
//! - **[`Scheduler`]** - Bounded-concurrency task queue (effects: 3, requests: 5)
//! - **[`validator`]** - Rule evaluation with async custom validators
//! - **[`registry`]** - Dependency graphs between fields
//! - **[`row`]** - Row context and range updates for dynamic groups
//! - **[`effects`]** - Effects and actions fired by value changes
//! - **[`requests`]** - Field option requests and their invalidation
//! - **[`init`]** - Dependency-ordered startup requests
//!
//! ```rust,ignore
//! let store = Store::new(StoreConfig::default());
//! store.register_field_validator("email", ValidationRule::required());
//! store.set_value("email", json!(""));
//! assert!(!store.validate("email").await);
//! ```

pub mod config;
pub mod dataflow;
pub mod effects;
pub mod error;
pub mod init;
pub mod notify;
pub mod registry;
pub mod requests;
pub mod row;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod validator;

pub use config::load_config;
pub use effects::{Action, ActionContext, Effect, EffectContext};
pub use error::{StoreError, StoreResult};
pub use init::{InitPhase, InitRequest, InitRequestContext, InitRequests};
pub use notify::{FieldChange, FieldEvent, FormEvent, Subscription, SubscriptionId};
pub use registry::{DependencyGraph, ValidateEffect};
pub use requests::{DispatchOptions, FieldRequestConfig, RequestContext};
pub use row::{RowContext, RowInfo, RowRange, RowUpdate, RowValues};
pub use scheduler::{Completion, Scheduler, TaskOutcome};
pub use state::{FieldState, FieldUpdate, FieldUpdates, FieldValues, FormFlags};
pub use store::Store;
pub use validator::{ValidationResult, ValidationRule, ValidatorArgs, ValidatorVerdict};

pub use shared::{
    FieldKey, FieldProps, FieldValue, FormMode, GroupId, RequestState, SchedulerStatus, StoreConfig,
};
