mod fetch;
mod inspect;

pub use self::fetch::run_fetch;
pub use self::inspect::run_inspect;
