use serde::Deserialize;
use serde::Serialize;

/// How a class exposes PCIe addressing information to containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// Look up per-device addressing in the inventory and set `PCIE_FLAG=true`
    #[display("fetch")]
    Fetch,
    /// Set `PCIE_FLAG=true` without any lookup
    #[display("flag_only")]
    FlagOnly,
    /// No addressing; `PCIE_FLAG=false`
    #[default]
    #[display("none")]
    None,
}

impl AddressingMode {
    pub const fn pcie_flag(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// A named family of accelerators advertised as one extended resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceClass {
    /// vendor domain, e.g. `carizon`
    pub vendor: String,
    /// device type as known to the inventory, e.g. `J5`
    pub device_type: String,
    /// extended resource name, `<vendor>/<type>`
    pub resource_name: String,
    /// env var carrying the comma separated device ids
    pub device_list_env: String,
    pub addressing: AddressingMode,
}

impl ResourceClass {
    pub fn new(vendor: &str, device_type: &str, addressing: AddressingMode) -> Self {
        Self {
            vendor: vendor.to_string(),
            device_type: device_type.to_string(),
            resource_name: format!("{vendor}/{device_type}"),
            device_list_env: format!("{}_DEVICE_{device_type}_IP_LIST", vendor.to_uppercase()),
            addressing,
        }
    }

    /// File name of this class's plugin socket inside the plugin directory.
    pub fn socket_name(&self) -> String {
        format!("{}_{}.sock", self.vendor, self.device_type)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn names_are_derived_from_vendor_and_type() {
        let class = ResourceClass::new("carizon", "J5", AddressingMode::Fetch);

        assert_eq!(class.resource_name, "carizon/J5");
        assert_eq!(class.device_list_env, "CARIZON_DEVICE_J5_IP_LIST");
        assert_eq!(class.socket_name(), "carizon_J5.sock");
    }

    #[test]
    fn only_none_clears_the_pcie_flag() {
        assert!(AddressingMode::Fetch.pcie_flag());
        assert!(AddressingMode::FlagOnly.pcie_flag());
        assert!(!AddressingMode::None.pcie_flag());
    }

    #[test]
    fn addressing_mode_parses_snake_case() {
        let mode: AddressingMode = serde_yaml::from_str("flag_only").expect("should parse");
        assert_eq!(mode, AddressingMode::FlagOnly);
    }
}
