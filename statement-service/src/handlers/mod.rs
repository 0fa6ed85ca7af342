mod health;
mod jobs;
mod maintenance;
mod statements;
mod sync;

pub use health::*;
pub use jobs::*;
pub use maintenance::*;
pub use statements::*;
pub use sync::*;
