pub mod apps;
pub mod execute;
pub mod reshard;
pub mod shards;
pub mod system;

pub use apps::*;
pub use execute::*;
pub use reshard::*;
pub use shards::*;
pub use system::*;
