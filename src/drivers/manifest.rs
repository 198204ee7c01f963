//! Device identity manifest
//!
//! Maps each known family to its link type and USB ids. Families without a
//! built driver are still listed so a plugged device can be named.

use serde::{Deserialize, Serialize};

use super::DriverKind;
use crate::transport::{TransportConfig, TransportMode};

/// One USB vendor/product pair a family is seen under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Kernel driver of the USB-serial bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl UsbId {
    fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            driver: None,
            label: None,
        }
    }

    fn bridge(mut self, driver: &str) -> Self {
        self.driver = Some(driver.to_string());
        self
    }

    fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub family: String,
    pub mode: TransportMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usb: Vec<UsbId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cts_flow_control: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_bits: Option<u8>,
}

impl ManifestEntry {
    fn new(family: &str, mode: TransportMode) -> Self {
        Self {
            family: family.to_string(),
            mode,
            usb: Vec::new(),
            bitrate: None,
            send_timeout_ms: None,
            receive_timeout_ms: None,
            cts_flow_control: false,
            stop_bits: None,
        }
    }

    fn usb(mut self, ids: Vec<UsbId>) -> Self {
        self.usb = ids;
        self
    }

    fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    fn timeouts(mut self, send_ms: u64, receive_ms: u64) -> Self {
        self.send_timeout_ms = Some(send_ms);
        self.receive_timeout_ms = Some(receive_ms);
        self
    }

    /// The built driver for this family, if there is one
    pub fn driver(&self) -> Option<DriverKind> {
        DriverKind::from_name(&self.family)
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.usb
            .iter()
            .any(|id| id.vendor_id == vendor_id && id.product_id == product_id)
    }

    /// Link parameters for the transport
    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::new(self.mode);
        config.bitrate = self.bitrate;
        config.receive_timeout_ms = self.receive_timeout_ms;
        config
    }
}

/// Every known device family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceManifest {
    pub entries: Vec<ManifestEntry>,
}

impl Default for DeviceManifest {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DeviceManifest {
    pub fn builtin() -> Self {
        use TransportMode::*;

        let bayer = 0x1a79;
        let prolific = || UsbId::new(0x067b, 0x2303).bridge("pl2303");
        let ftdi = || UsbId::new(0x0403, 0x6001).bridge("ftdi").label("FTDI cable");
        let ch340 = || UsbId::new(0x1a86, 0x7523).label("CH340 cable");

        let mut animas = ManifestEntry::new("Animas", Serial)
            .bitrate(9600)
            .timeouts(500, 500)
            .usb(vec![prolific()]);
        animas.cts_flow_control = true;

        let mut relion = ManifestEntry::new("ReliOnPrime", Serial)
            .bitrate(19200)
            .usb(vec![UsbId::new(0x0efb, 0x0011).bridge("cp2102"), UsbId::new(0x0403, 0x6001)]);
        relion.stop_bits = Some(2);

        let entries = vec![
            ManifestEntry::new("Dexcom", Serial).usb(vec![UsbId::new(0x22a3, 0x0047).bridge("cdc-acm")]),
            ManifestEntry::new("BayerContourNext", Hid).usb(vec![
                UsbId::new(bayer, 0x7350).label("Contour Next"),
                UsbId::new(bayer, 0x7410).label("Contour Next USB"),
                UsbId::new(bayer, 0x6200).label("Contour Next Link"),
                UsbId::new(bayer, 0x6300).label("Contour Next Link mmol/L"),
                UsbId::new(bayer, 0x6210).label("Contour Next Link 2.4"),
                UsbId::new(bayer, 0x6002).label("Contour USB"),
                UsbId::new(bayer, 0x7800).label("Contour Next One"),
                UsbId::new(bayer, 0x7900).label("Ascensia Contour Next"),
            ]),
            ManifestEntry::new("OneTouchUltraMini", Serial).usb(vec![prolific(), ftdi(), ch340()]),
            ManifestEntry::new("InsuletOmniPod", Block).usb(vec![
                UsbId::new(0x1e36, 0x0002).label("Eros PDM"),
                UsbId::new(0x0e8d, 0x201d).label("Dash PDM"),
            ]),
            ManifestEntry::new("Medtronic", Hid).usb(vec![
                UsbId::new(bayer, 0x6300).label("Contour Next Link mmol/L"),
                UsbId::new(bayer, 0x6200).label("Contour Next Link"),
            ]),
            ManifestEntry::new("Tandem", Serial)
                .bitrate(921_600)
                .timeouts(50, 50)
                .usb(vec![UsbId::new(0x0483, 0x5740).bridge("cdc-acm")]),
            ManifestEntry::new("AbbottFreeStyleLite", Serial).bitrate(19200).usb(vec![
                UsbId::new(0x1a61, 0x3410).bridge("tusb3410").label("Abbott cable"),
                ftdi(),
            ]),
            ManifestEntry::new("AbbottFreeStyleLibre", Hid).usb(vec![
                UsbId::new(0x1a61, 0x3650).label("FreeStyle Libre"),
                UsbId::new(0x1a61, 0x3670).label("FreeStyle Libre Pro"),
            ]),
            animas,
            ManifestEntry::new("OneTouchUltra2", Serial)
                .bitrate(9600)
                .timeouts(5000, 5000)
                .usb(vec![prolific(), ftdi(), ch340()]),
            ManifestEntry::new("OneTouchVerioBLE", Bluetooth),
            relion,
            ManifestEntry::new("AbbottLibreView", Block),
        ];
        Self { entries }
    }

    pub fn get(&self, family: &str) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .find(|e| e.family.eq_ignore_ascii_case(family))
    }

    /// Every family seen under these USB ids
    pub fn find_all_by_usb_ids(&self, vendor_id: u16, product_id: u16) -> Vec<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches(vendor_id, product_id))
            .collect()
    }

    /// The family to use for a plugged device, preferring one with a driver
    pub fn find_by_usb_ids(&self, vendor_id: u16, product_id: u16) -> Option<&ManifestEntry> {
        let matches = self.find_all_by_usb_ids(vendor_id, product_id);
        matches
            .iter()
            .find(|e| e.driver().is_some())
            .or_else(|| matches.first())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_driver_has_an_entry() {
        let manifest = DeviceManifest::builtin();
        for kind in DriverKind::ALL {
            let entry = manifest.get(kind.family()).unwrap();
            assert_eq!(entry.driver(), Some(kind));
            assert_eq!(entry.mode, kind.mode());
        }
    }

    #[test]
    fn test_usb_lookup_prefers_built_driver() {
        let manifest = DeviceManifest::builtin();
        // the Contour Next Link is listed under Medtronic too
        assert_eq!(manifest.find_all_by_usb_ids(0x1a79, 0x6200).len(), 2);
        let entry = manifest.find_by_usb_ids(0x1a79, 0x6200).unwrap();
        assert_eq!(entry.family, "BayerContourNext");

        let tandem = manifest.find_by_usb_ids(0x0483, 0x5740).unwrap();
        assert_eq!(tandem.family, "Tandem");
        assert_eq!(tandem.driver(), None);

        assert!(manifest.find_by_usb_ids(0xffff, 0xffff).is_none());
    }

    #[test]
    fn test_entry_json() {
        let manifest = DeviceManifest::builtin();
        let json = serde_json::to_value(manifest.get("Dexcom").unwrap()).unwrap();
        assert_eq!(json["mode"], "serial");
        assert_eq!(json["usb"][0]["vendorId"], 8867);
        assert_eq!(json["usb"][0]["driver"], "cdc-acm");
        assert!(json.get("ctsFlowControl").is_none());

        let config = manifest.get("Tandem").unwrap().transport_config();
        assert_eq!(config.bitrate, Some(921_600));
        assert_eq!(config.receive_timeout_ms, Some(50));
    }
}
