//! Types for use when configuring ferry modules.

use crate::*;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> FerryResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| FerryError::other_src("encode", e))?,
    )
    .map_err(|e| FerryError::other_src("decode", e))
}

/// Denotes a type used to configure a specific ferry module.
///
/// Note, the types defined in this struct are specifically for configuration
/// that cannot be changed at runtime, the likes of which might be found
/// in a configuration file.
///
/// It is highly recommended that you expose this struct in your module
/// docs to help devs using your module understand how to configure it.
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

/// Ferry configuration.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Config(
    std::sync::Mutex<serde_json::Map<String, serde_json::Value>>,
);

impl Config {
    /// Set a module's configuration. Module factories call this while
    /// the builder constructs its default config; callers may then call
    /// it again to override a module wholesale before the builder is
    /// frozen.
    pub fn set_module_config<M: ModConfig>(&self, m: &M) -> FerryResult<()> {
        let map: serde_json::Map<String, serde_json::Value> = tc(m)?;
        let mut lock = self.0.lock().unwrap();
        for (k, v) in map {
            lock.insert(k, v);
        }
        Ok(())
    }

    /// When ferry is initializing, it will call the factory function
    /// for all of its modules with a reference to this config struct.
    /// Each of those modules may choose to call this function to extract
    /// a module config. Note that this config may be loaded from disk and
    /// edited by humans, so the serialization on the module config should
    /// be tolerant to missing properties, setting sane defaults.
    pub fn get_module_config<M: ModConfig>(&self) -> FerryResult<M> {
        tc(&*self.0.lock().unwrap())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase", default)]
    struct Mod1 {
        mod1: Mod1Inner,
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase", default)]
    struct Mod1Inner {
        p_a: u32,
        p_b: String,
    }

    impl Default for Mod1 {
        fn default() -> Self {
            Self {
                mod1: Mod1Inner::default(),
            }
        }
    }

    impl Default for Mod1Inner {
        fn default() -> Self {
            Self {
                p_a: 42,
                p_b: "default".into(),
            }
        }
    }

    impl ModConfig for Mod1 {}

    #[test]
    fn defaults_round_trip() {
        let config = Config::default();
        config.set_module_config(&Mod1::default()).unwrap();
        let m: Mod1 = config.get_module_config().unwrap();
        assert_eq!(Mod1::default(), m);
    }

    #[test]
    fn later_set_overrides_defaults() {
        let config = Config::default();
        config.set_module_config(&Mod1::default()).unwrap();
        config
            .set_module_config(&Mod1 {
                mod1: Mod1Inner {
                    p_a: 7,
                    p_b: "override".into(),
                },
            })
            .unwrap();
        let m: Mod1 = config.get_module_config().unwrap();
        assert_eq!(7, m.mod1.p_a);
        assert_eq!("override", m.mod1.p_b);
    }

    #[test]
    fn loadable_from_json() {
        let config: Config = serde_json::from_str(
            r#"{ "mod1": { "pA": 7, "pB": "from-disk" } }"#,
        )
        .unwrap();
        let m: Mod1 = config.get_module_config().unwrap();
        assert_eq!(7, m.mod1.p_a);
        assert_eq!("from-disk", m.mod1.p_b);
    }

    #[test]
    fn missing_module_gets_defaults() {
        let config = Config::default();
        let m: Mod1 = config.get_module_config().unwrap();
        assert_eq!(Mod1::default(), m);
    }
}
