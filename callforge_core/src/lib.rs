pub mod config;
pub mod corpus;
pub mod encoding;
pub mod generation;
pub mod minimization;
pub mod mutation;
pub mod prio;
pub mod prog;
mod random;
pub mod size;
pub mod target;
pub mod targets;

pub use config::CallforgeConfig;
pub use corpus::{Corpus, CorpusError, ProgCorpus};
pub use encoding::{DecodeError, deserialize};
pub use generation::generate;
pub use minimization::minimize;
pub use mutation::{MutationWeights, ProgMutator};
pub use prio::{ChoiceTable, ChoiceTableError, calculate_priorities, enabled_by_name};
pub use prog::{
    Arg, ArgPath, Call, ConstArg, DataArg, GroupArg, PointerArg, Prog, ResultArg, ResultId,
    UnionArg, ValidationError,
};
pub use target::{Target, TargetBuilder, TargetError};
pub use targets::{get_target, supported_targets};
