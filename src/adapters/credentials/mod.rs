mod provider;

pub use provider::CredentialProvider;
