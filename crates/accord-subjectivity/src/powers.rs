//! Local trust in administrators.

use std::collections::BTreeMap;
use std::sync::RwLock;

use accord_identity::Id;

use crate::error::{Error, Result};

/// Power assumed for administrators we have no opinion on.
pub const DEFAULT_POWER: f64 = 0.5;

/// Administrator id to power in [0, 1].
#[derive(Debug, Default)]
pub struct Powers {
    map: RwLock<BTreeMap<Id, f64>>,
}

impl Powers {
    pub fn from_map(map: BTreeMap<Id, f64>) -> Self {
        let map = map
            .into_iter()
            .filter(|(_, v)| is_valid_power(*v))
            .collect();
        Self {
            map: RwLock::new(map),
        }
    }

    pub fn get(&self, administrator: Id) -> f64 {
        self.map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&administrator)
            .copied()
            .unwrap_or(DEFAULT_POWER)
    }

    pub fn set(&self, administrator: Id, value: f64) -> Result<()> {
        if !is_valid_power(value) {
            return Err(Error::InvalidPower {
                administrator,
                value,
            });
        }
        self.map
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(administrator, value);
        Ok(())
    }

    pub fn remove(&self, administrator: Id) -> Option<f64> {
        self.map
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&administrator)
    }

    pub fn snapshot(&self) -> BTreeMap<Id, f64> {
        self.map.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn is_valid_power(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_power() {
        let powers = Powers::default();
        assert_eq!(powers.get(Id(3)), DEFAULT_POWER);
    }

    #[test]
    fn test_set_bounds() {
        let powers = Powers::default();
        powers.set(Id(1), 0.0).unwrap();
        powers.set(Id(2), 1.0).unwrap();
        assert_eq!(powers.get(Id(1)), 0.0);
        assert_eq!(powers.get(Id(2)), 1.0);

        assert!(matches!(
            powers.set(Id(3), 1.5),
            Err(Error::InvalidPower { .. })
        ));
        assert!(powers.set(Id(3), -0.1).is_err());
        assert!(powers.set(Id(3), f64::NAN).is_err());
        assert_eq!(powers.get(Id(3)), DEFAULT_POWER);
    }

    #[test]
    fn test_from_map_drops_invalid() {
        let mut map = BTreeMap::new();
        map.insert(Id(1), 0.25);
        map.insert(Id(2), f64::NAN);
        map.insert(Id(3), 7.0);
        let powers = Powers::from_map(map);
        assert_eq!(powers.snapshot().len(), 1);
        assert_eq!(powers.get(Id(1)), 0.25);
    }
}
