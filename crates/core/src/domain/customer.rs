use serde::{Deserialize, Serialize};

/// Contact and delivery facts collected from the customer during checkout.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerContact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
}

impl CustomerContact {
    /// Overlays every field present in `patch`, leaving the rest untouched.
    pub fn merge(&mut self, patch: &CustomerContact) {
        if let Some(name) = &patch.name {
            self.name = Some(name.clone());
        }
        if let Some(phone) = &patch.phone {
            self.phone = Some(phone.clone());
        }
        if let Some(city) = &patch.city {
            self.city = Some(city.clone());
        }
        if let Some(delivery_point) = &patch.delivery_point {
            self.delivery_point = Some(delivery_point.clone());
        }
        if let Some(payment_method) = &patch.payment_method {
            self.payment_method = Some(payment_method.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.phone.is_none()
            && self.city.is_none()
            && self.delivery_point.is_none()
            && self.payment_method.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::CustomerContact;

    #[test]
    fn merge_only_overwrites_present_fields() {
        let mut contact = CustomerContact {
            name: Some("Olena".to_string()),
            phone: Some("+380501112233".to_string()),
            ..CustomerContact::default()
        };

        contact.merge(&CustomerContact {
            city: Some("Lviv".to_string()),
            phone: Some("+380509998877".to_string()),
            ..CustomerContact::default()
        });

        assert_eq!(contact.name.as_deref(), Some("Olena"));
        assert_eq!(contact.phone.as_deref(), Some("+380509998877"));
        assert_eq!(contact.city.as_deref(), Some("Lviv"));
        assert!(!contact.is_empty());
        assert!(CustomerContact::default().is_empty());
    }
}
