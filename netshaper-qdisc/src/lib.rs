#![doc(issue_tracker_base_url = "https://github.com/chainbound/netshaper/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod class;
pub use class::TrafficClass;

mod discipline;
pub use discipline::{
    DisciplineKind, QdiscOptions, QueueDiscipline, DEFAULT_CLASS_LIMIT, DEFAULT_LIMIT,
};

mod drr;
mod wfq;

mod error;
pub use error::{QdiscError, Result, TokenBucketError};

mod stats;
pub use stats::{ClassStats, QdiscStats};

pub mod token_bucket;
pub use token_bucket::{MultiRateTokenBucket, TokenBucket, TokenBucketConfig, TokenBucketStats};

mod shaper;
pub use shaper::{ShaperError, ShaperHook, TrafficShaper};
