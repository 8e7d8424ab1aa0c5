pub mod contract;
pub mod retry;
pub mod rpc;
pub mod signature;

pub use contract::{EvmServingContract, SettlementContract, TEESettlementData};
pub use retry::TxRetryPolicy;
pub use rpc::{ChainRpc, JsonRpcClient};
pub use signature::{LocalTeeSigner, RemoteTeeSigner, TeeSigner};
