//! Well-known key formats stored in the meta map.

pub fn chunk_key(id: u32) -> String {
    format!("chunk.{id}")
}

pub fn root_key(map_id: u32) -> String {
    format!("root.{map_id}")
}

pub fn map_key(map_id: u32) -> String {
    format!("map.{map_id}")
}

pub fn name_key(name: &str) -> String {
    format!("name.{name}")
}

pub fn setting_key(name: &str) -> String {
    format!("setting.{name}")
}

pub const STORE_VERSION_SETTING: &str = "storeVersion";
pub const CURRENT_STORE_VERSION: u32 = 1;

/// `map.<id>` value: `name=…,createVersion=…`.
pub fn encode_map_descriptor(name: &str, create_version: u64) -> String {
    format!("name={name},createVersion={create_version}")
}

pub fn decode_map_descriptor(value: &str) -> crate::Result<(String, u64)> {
    let bad = || crate::StoreError::illegal_state(format!("malformed map descriptor: {value}"));
    let mut name = None;
    let mut create_version = None;
    for kv in value.split(',') {
        let (k, v) = kv.split_once('=').ok_or_else(bad)?;
        match k {
            "name" => name = Some(v.to_string()),
            "createVersion" => create_version = Some(v.parse().map_err(|_| bad())?),
            _ => {}
        }
    }
    Ok((name.ok_or_else(bad)?, create_version.ok_or_else(bad)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_descriptor_round_trips() {
        let encoded = encode_map_descriptor("things", 7);
        let (name, version) = decode_map_descriptor(&encoded).unwrap();
        assert_eq!(name, "things");
        assert_eq!(version, 7);
    }
}
