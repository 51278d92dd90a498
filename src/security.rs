//! The transaction security settings.
//!
//! A [`SecuritySetting`] value gathers everything the caller decides *before*
//! the transaction: PIN transmission mode, session splitting policy, the
//! authorized session keys and the optional SAM revocation lookup. Defaults
//! can come from a configuration file or the environment through
//! [`SecuritySettingConfig`].

// Uses
use derivative::Derivative;
use figment::{
	providers::{Env, Format, Serialized, Toml},
	value::{Dict, Map},
	Error as FigmentError,
	Figment,
	Metadata,
	Profile,
	Provider,
};
use serde_derive::{Deserialize, Serialize};

use crate::{crypto::SamRevocationService, enum_repr_fallible, error::ParseError};

// Constants
const FILE_NAME: &str = "calex.toml";
/// Concatenated with the variable names below.
const ENV_PREFIX: &str = "CALEX_";
const ENV_FILE_NAME_OVERRIDE: &str = "CONFIG";
const ENV_PROFILE: &str = "PROFILE";

enum_repr_fallible! {
/// The privilege level declared when opening a secure session.
///
/// The discriminants are the card's session key indexes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WriteAccessLevel: u8, ParseError, { |_| ParseError::NonCompliant } {
	Personalization = 0x01 => "Personalization",
	Load            = 0x02 => "Load",
	Debit           = 0x03 => "Debit",
}
}

/// The on-disk/environment face of [`SecuritySetting`].
#[non_exhaustive]
#[derive(Deserialize, Serialize)]
pub struct SecuritySettingConfig {
	#[serde(skip)]
	pub profile: Profile,
	pub plain_pin_transmission: bool,
	pub multiple_session: bool,
	pub read_on_session_opening_disabled: bool,
}

impl Default for SecuritySettingConfig {
	fn default() -> SecuritySettingConfig {
		SecuritySettingConfig {
			profile: Self::DEFAULT_PROFILE,
			plain_pin_transmission: false,
			multiple_session: false,
			read_on_session_opening_disabled: false,
		}
	}
}

impl SecuritySettingConfig {
	// Constants
	pub const DEFAULT_PROFILE: Profile = Profile::const_new("default");
	// Key Names
	pub const PLAIN_PIN_TRANSMISSION: &'static str = "plain_pin_transmission";
	pub const MULTIPLE_SESSION: &'static str = "multiple_session";
	pub const READ_ON_SESSION_OPENING_DISABLED: &'static str = "read_on_session_opening_disabled";

	/// Allows the configuration to be extracted from any [`Provider`].
	///
	/// The reason this isn't a [`TryFrom`] implementation is because it
	/// conflicts with a default implementation provided by Rust.
	pub fn try_from<P>(provider: P) -> Result<SecuritySettingConfig, FigmentError>
	where
		P: Provider,
	{
		Figment::from(provider).extract()
	}

	/// Provides the default provider hierarchy: defaults, then `calex.toml`,
	/// then `CALEX_`-prefixed environment variables.
	pub fn figment() -> Figment {
		Figment::from(Serialized::defaults(SecuritySettingConfig::default()))
			.merge(
				Toml::file(Env::var_or(
					format!("{}{}", ENV_PREFIX, ENV_FILE_NAME_OVERRIDE).as_str(),
					FILE_NAME,
				))
				.nested(),
			)
			.merge(
				Env::prefixed(ENV_PREFIX)
					.ignore(&[ENV_FILE_NAME_OVERRIDE, ENV_PROFILE])
					.global(),
			)
			.select(Profile::from_env_or(
				format!("{}{}", ENV_PREFIX, ENV_PROFILE).as_str(),
				Self::DEFAULT_PROFILE,
			))
	}
}

impl Provider for SecuritySettingConfig {
	fn metadata(&self) -> Metadata {
		Metadata::named("Security Setting Config")
	}

	fn data(&self) -> Result<Map<Profile, Dict>, FigmentError> {
		Serialized::defaults(self).data()
	}

	fn profile(&self) -> Option<Profile> {
		Some(self.profile.clone())
	}
}

/// The security parameters of one transaction.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct SecuritySetting {
	plain_pin_transmission_enabled: bool,
	multiple_session_enabled: bool,
	read_on_session_opening_disabled: bool,
	pin_verification_ciphering_key: Option<(u8, u8)>,
	pin_modification_ciphering_key: Option<(u8, u8)>,
	/// Authorized `(KIF, KVC)` pairs. Empty means "any".
	authorized_session_keys: Vec<(u8, u8)>,
	#[derivative(Debug = "ignore")]
	sam_revocation_service: Option<Box<dyn SamRevocationService>>,
}

impl SecuritySetting {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds the boolean options from a loaded configuration.
	pub fn from_config(config: &SecuritySettingConfig) -> Self {
		let mut setting = Self::default();
		setting.plain_pin_transmission_enabled = config.plain_pin_transmission;
		setting.multiple_session_enabled = config.multiple_session;
		setting.read_on_session_opening_disabled = config.read_on_session_opening_disabled;
		setting
	}

	/// Allows Verify PIN / Change PIN to travel in plain text.
	pub fn enable_pin_plain_transmission(&mut self) -> &mut Self {
		self.plain_pin_transmission_enabled = true;
		self
	}

	/// Allows the engine to split an overflowing session into several atomic
	/// sessions.
	pub fn enable_multiple_session(&mut self) -> &mut Self {
		self.multiple_session_enabled = true;
		self
	}

	/// Keeps the first queued read out of the Open Secure Session APDU.
	pub fn disable_read_on_session_opening(&mut self) -> &mut Self {
		self.read_on_session_opening_disabled = true;
		self
	}

	pub fn set_pin_verification_ciphering_key(&mut self, kif: u8, kvc: u8) -> &mut Self {
		self.pin_verification_ciphering_key = Some((kif, kvc));
		self
	}

	pub fn set_pin_modification_ciphering_key(&mut self, kif: u8, kvc: u8) -> &mut Self {
		self.pin_modification_ciphering_key = Some((kif, kvc));
		self
	}

	pub fn add_authorized_session_key(&mut self, kif: u8, kvc: u8) -> &mut Self {
		self.authorized_session_keys.push((kif, kvc));
		self
	}

	pub fn set_sam_revocation_service(
		&mut self,
		service: Box<dyn SamRevocationService>,
	) -> &mut Self {
		self.sam_revocation_service = Some(service);
		self
	}

	pub fn is_plain_pin_transmission_enabled(&self) -> bool {
		self.plain_pin_transmission_enabled
	}

	pub fn is_multiple_session_enabled(&self) -> bool {
		self.multiple_session_enabled
	}

	pub fn is_read_on_session_opening_disabled(&self) -> bool {
		self.read_on_session_opening_disabled
	}

	pub fn pin_verification_ciphering_key(&self) -> Option<(u8, u8)> {
		self.pin_verification_ciphering_key
	}

	pub fn pin_modification_ciphering_key(&self) -> Option<(u8, u8)> {
		self.pin_modification_ciphering_key
	}

	/// Whether the advertised session key may open a session. An empty
	/// authorized set accepts any key.
	pub fn is_session_key_authorized(&self, kif: u8, kvc: u8) -> bool {
		self.authorized_session_keys.is_empty()
			|| self.authorized_session_keys.contains(&(kif, kvc))
	}

	pub fn sam_revocation_service(&self) -> Option<&dyn SamRevocationService> {
		self.sam_revocation_service.as_deref()
	}
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use figment::Jail;

	use super::{SecuritySetting, SecuritySettingConfig, WriteAccessLevel};
	use crate::error::ParseError;

	// Tests
	/// Ensures the write access levels carry the card's key indexes.
	#[test]
	fn write_access_level_key_indexes() {
		assert_eq!(0x01_u8, WriteAccessLevel::Personalization.into());
		assert_eq!(0x02_u8, WriteAccessLevel::Load.into());
		assert_eq!(0x03_u8, WriteAccessLevel::Debit.into());
		assert_eq!(
			Err(ParseError::NonCompliant),
			WriteAccessLevel::try_from(0x04)
		);
	}

	/// Ensures an empty authorized set accepts any key, and a non-empty set
	/// only its members.
	#[test]
	fn session_key_authorization() {
		let mut setting = SecuritySetting::new();
		assert!(setting.is_session_key_authorized(0x30, 0x79));

		setting.add_authorized_session_key(0x30, 0x79);
		assert!(setting.is_session_key_authorized(0x30, 0x79));
		assert!(!setting.is_session_key_authorized(0x30, 0x7A));
	}

	/// Ensures configuration values flow from file and environment into the
	/// setting.
	#[test]
	fn config_layering() {
		Jail::expect_with(|jail| {
			jail.create_file(
				"calex.toml",
				r#"
					[default]
					multiple_session = true
				"#,
			)?;
			jail.set_env("CALEX_PLAIN_PIN_TRANSMISSION", "true");

			let config = SecuritySettingConfig::try_from(SecuritySettingConfig::figment())?;
			let setting = SecuritySetting::from_config(&config);

			assert!(setting.is_multiple_session_enabled());
			assert!(setting.is_plain_pin_transmission_enabled());
			assert!(!setting.is_read_on_session_opening_disabled());

			Ok(())
		});
	}
}
