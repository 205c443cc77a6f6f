pub mod credentials;
pub mod proxy_keys;
pub mod request_logs;

pub use credentials::Entity as Credentials;
pub use proxy_keys::Entity as ProxyKeys;
pub use request_logs::Entity as RequestLogs;
