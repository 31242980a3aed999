#![doc(issue_tracker_base_url = "https://github.com/chainbound/netshaper/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use netshaper_common::*;
pub use netshaper_qdisc::*;
pub use netshaper_sim::*;
