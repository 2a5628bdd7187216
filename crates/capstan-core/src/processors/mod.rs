//! Single-responsibility pipeline processors.
//!
//! Each processor performs one transformation or side effect and is
//! composed into the named pipelines built by the process manager.

pub mod cancel;
pub mod configuration;
pub mod entry;
pub mod exclusive_group;
pub mod policy_checks;
pub mod repository;
pub mod resume;
pub mod validation;

pub use self::cancel::CancelProcessor;
pub use self::configuration::ConfigurationProcessor;
pub use self::entry::{EnqueueProcessor, InitialQueueEntryProcessor, QueueFailureHandler};
pub use self::exclusive_group::ExclusiveGroupProcessor;
pub use self::policy_checks::{
    ForkDepthPolicyProcessor, PolicyResolveProcessor, QueuePolicyProcessor,
    RawPayloadPolicyProcessor,
};
pub use self::repository::RepositoryProcessor;
pub use self::resume::{DispatchProcessor, ResumeDataProcessor};
pub use self::validation::{ResumeValidationProcessor, ValidationProcessor};

/// Header under which the staged workspace path is carried.
pub const WORKSPACE_HEADER: &str = "_workspace";

/// Header carrying an explicit repository URL.
pub const REPO_URL_HEADER: &str = "repoUrl";

/// Header carrying the branch, tag or commit to resolve.
pub const REPO_REF_HEADER: &str = "repoBranchOrTag";
