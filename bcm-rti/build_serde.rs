use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

// ---------- registers.yaml ----------

/// Parsed register file: MMIO registers per BAR plus ordered config-space writes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegisterFile {
    pub bar0: Vec<(String, Register)>,
    pub bar1: Vec<(String, Register)>,
    pub config: Vec<(String, ConfigWrite)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Register {
    #[serde(deserialize_with = "hex_or_int")]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigWrite {
    #[serde(deserialize_with = "hex_or_int")]
    pub offset: u64,
    #[serde(deserialize_with = "hex_or_int")]
    pub value: u64,
}

struct HexOrIntVisitor;

impl<'de> Visitor<'de> for HexOrIntVisitor {
    type Value = u64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an unsigned integer or a `0x`-prefixed hex string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::custom(format!("negative value {}", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        let digits = v.trim().replace('_', "");
        let parsed = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => digits.parse(),
        };
        parsed.map_err(|e| E::custom(format!("invalid number {:?}: {}", v, e)))
    }
}

fn hex_or_int<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(HexOrIntVisitor)
}

struct RegisterFileVisitor;

impl<'de> Visitor<'de> for RegisterFileVisitor {
    type Value = RegisterFile;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a register file")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let mut file = RegisterFile::default();

        // Keep file order: config writes are applied in the order they are listed.
        while let Some(key) = access.next_key()? {
            let key: String = key;
            let (kind, name) = key.split_once('/').ok_or_else(|| {
                <M::Error as de::Error>::custom(
                    "item names must be in form `kind/name`, where kind is `bar0`, `bar1` or `config`",
                )
            })?;
            let name = name.to_string();
            let duplicate = file.bar0.iter().any(|(n, _)| *n == name)
                || file.bar1.iter().any(|(n, _)| *n == name)
                || file.config.iter().any(|(n, _)| *n == name);
            if duplicate {
                return Err(de::Error::custom(format!("Duplicate item {:?}", key)));
            }
            match kind {
                "bar0" => {
                    let val: Register = access.next_value()?;
                    file.bar0.push((name, val));
                }
                "bar1" => {
                    let val: Register = access.next_value()?;
                    file.bar1.push((name, val));
                }
                "config" => {
                    let val: ConfigWrite = access.next_value()?;
                    file.config.push((name, val));
                }
                _ => return Err(de::Error::custom(format!("Unknown kind {:?}", kind))),
            }
        }

        Ok(file)
    }
}

impl<'de> Deserialize<'de> for RegisterFile {
    fn deserialize<D>(deserializer: D) -> Result<RegisterFile, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(RegisterFileVisitor)
    }
}
