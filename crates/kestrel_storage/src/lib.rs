//! KestrelDB storage core: the chunked page store, the copy-on-write
//! B-tree map, and the page-operation engine that serialises writes per
//! leaf page.

pub mod chunk;
pub mod cursor;
pub mod handler;
pub mod map;
pub mod page;
pub mod page_op;
pub mod store;

#[cfg(test)]
mod tests;

pub use cursor::MapCursor;
pub use handler::{
    HandlerPool, OpContext, PageOperation, PageOperationHandler, PageOperationResult,
    RunnableOperation,
};
pub use map::{BTreeMap, Descent, RemoveListener, SplitListener};
pub use page::{
    DatumType, LeafPageMovePlan, Page, PageContent, PageKey, PageRef, Value, ValueType,
};
pub use page_op::{GuardDecision, SingleWrite, SyncListener, WriteKind, WriteOutcome};
pub use store::PageStore;
