pub mod keys;
pub mod types;

pub use keys::{
    KeyError, TARGET_TAG, defaults, instance_name, policy_name, validate_actor, validate_run_id,
    validate_target_key,
};
pub use types::*;
