mod sandbox;

pub use sandbox::SandboxMarketplace;
