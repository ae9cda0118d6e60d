use std::collections::{BTreeSet, HashMap};

/// Devices known to the firmware service, in the order they are presented to
/// users. Some devices share a type code, meaning they receive the same
/// firmware.
pub const KNOWN_DEVICES: &[(&str, u32)] = &[
    ("NGC Modkit", 91),
    ("Ultimate 2C Bluetooth", 96),
    ("NGC Adapter", 92),
    ("Saturn Adapter", 99),
    ("Ultimate MG", 100),
    ("Ultimate MGX", 79),
    ("M30 Wired for Xbox", 69),
    ("8BitDo Ultimate C Bluetooth", 66),
    ("8BitDo Mirco", 60),
    ("8BitDo Retro Receiver for PS", 59),
    ("8BitDo NEOGEO", 57),
    ("8BitDo Arcade Stick for Xbox", 51),
    ("N64 Modkit", 53),
    ("Ultimate C", 48),
    ("Ultimate C Wired", 50),
    ("Ultimate 2.4g", 43),
    ("Ultimate 2.4g Adapter", 44),
    ("Ultimate", 42),
    ("Ultimate Adapter", 42),
    ("Ultimate Wired", 45),
    ("Lite 2", 47),
    ("Lite SE", 46),
    ("8BitDo Ultimate for Xbox", 40),
    ("8BitDo Pro 2 Wired", 37),
    ("8BitDo USB Adapter 2", 39),
    ("8BitDo Pro 2 for Xbox", 37),
    ("8BitDo Pro 2", 33),
    ("8BitDo Arcade Stick", 34),
    ("8BitDo Arcade Stick Receiver", 35),
    ("8BitDo SN30 Pro for Android", 31),
    ("8BitDo Zero 2 gamepad", 29),
    ("8BitDo Lite gamepad", 28),
    ("8BitDo S30 Modkit", 27),
    ("8BitDo Dogbone Modkit", 26),
    ("8BitDo SN30 Plus +", 25),
    ("Retro Receiver for MD/Genesis", 21),
    ("8BitDo M30", 22),
    ("8BitDo GBros. Apdater", 20),
    ("8BitDo N30 Pro 2", 19),
    ("8Bitdo SF30 Pro", 9),
    ("8Bitdo N30 Arcade Stick", 4),
    ("8Bitdo FC30 Pro", 13),
    ("8Bitdo F30", 2),
    ("8Bitdo N30", 18),
    ("8Bitdo SN30", 17),
    ("8Bitdo SF30", 3),
    ("8BitDo N64", 10),
    ("8BitDo F30 Arcade Stick", 5),
    ("8BitDo USB Apdater", 8),
    ("8BitDo Classic RR", 6),
    ("8BitDo NES RR", 7),
    ("8BitDo SFC RR", 7),
    ("8BitDo P30 Modkit", 24),
    ("8BitDo SN30 Modkit", 16),
    ("8BitDo N30 Modkit", 15),
    ("8BitDo M30 Modkit", 14),
    ("8BitDo USB Apdater for PS classic", 8),
];

/// A device name and the type code the firmware service uses for it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    pub name: String,
    pub type_code: u32,
}

/// Immutable name to type code table. Iteration follows insertion order and
/// exact name lookups are constant time.
#[derive(Clone, Debug, Default)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
    index: HashMap<String, usize>,
}

impl DeviceCatalog {
    /// Build a catalog from `(name, type code)` pairs. If a name appears more
    /// than once, it keeps its first position and takes the last type code.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut catalog = Self::default();

        for (name, type_code) in entries {
            let name = name.into();

            match catalog.index.get(&name) {
                Some(&i) => catalog.devices[i].type_code = type_code,
                None => {
                    catalog.index.insert(name.clone(), catalog.devices.len());
                    catalog.devices.push(Device { name, type_code });
                }
            }
        }

        catalog
    }

    /// The catalog of all devices supported by the official firmware service.
    pub fn builtin() -> Self {
        Self::new(KNOWN_DEVICES.iter().copied())
    }

    /// Look up a device by its exact name.
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.index.get(name).map(|&i| &self.devices[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Distinct type codes in ascending order.
    pub fn type_codes(&self) -> Vec<u32> {
        self.devices.iter()
            .map(|d| d.type_code)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Names of all devices sharing a type code, in catalog order.
    pub fn names_for(&self, type_code: u32) -> Vec<&str> {
        self.devices.iter()
            .filter(|d| d.type_code == type_code)
            .map(|d| d.name.as_str())
            .collect()
    }
}
