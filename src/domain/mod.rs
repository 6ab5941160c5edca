mod card;
mod entry;
mod identifiers;
mod ledger;
mod lifecycle;
mod money;
mod rollup;

pub use card::*;
pub use entry::*;
pub use identifiers::*;
pub use ledger::*;
pub use lifecycle::*;
pub use money::*;
pub use rollup::*;
