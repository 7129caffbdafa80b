pub mod clock;
pub mod events;
pub mod identity;
pub mod ids;
pub mod incident;
pub mod session;
