use std::collections::HashSet;

use serde_json::Value;

use crate::user::User;

/// Applies the configured privacy rules to users before they are serialized into event payloads.
///
/// The user's `key` always survives. Every other attribute (built-in or custom) is removed if
/// `all_attributes_private` is set, or if its name appears in the global private list or in the
/// user's own private list. Removed names are reported (sorted) under `privateAttrs`.
pub struct UserFilter {
    all_attributes_private: bool,
    private_attribute_names: HashSet<String>,
}

impl UserFilter {
    pub fn new(all_attributes_private: bool, private_attribute_names: &[String]) -> UserFilter {
        UserFilter {
            all_attributes_private,
            private_attribute_names: private_attribute_names.iter().cloned().collect(),
        }
    }

    pub fn filter_user(&self, user: &User) -> Value {
        let mut json =
            serde_json::to_value(user).expect("user serialization is infallible");
        let obj = match json.as_object_mut() {
            Some(obj) => obj,
            None => return json,
        };

        // the per-user private list drives filtering but never appears on the wire
        obj.remove("privateAttributeNames");

        let is_private = |name: &str| {
            self.all_attributes_private
                || self.private_attribute_names.contains(name)
                || user.private_attribute_names().iter().any(|n| n == name)
        };

        let mut removed: Vec<String> = Vec::new();

        let top_level: Vec<String> = obj
            .keys()
            .filter(|k| *k != "key" && *k != "custom")
            .cloned()
            .collect();
        for name in top_level {
            if is_private(&name) {
                obj.remove(&name);
                removed.push(name);
            }
        }

        if let Some(Value::Object(custom)) = obj.get_mut("custom") {
            let custom_names: Vec<String> = custom.keys().cloned().collect();
            for name in custom_names {
                if is_private(&name) {
                    custom.remove(&name);
                    removed.push(name);
                }
            }
        }

        if !removed.is_empty() {
            removed.sort();
            obj.insert("privateAttrs".to_owned(), Value::from(removed));
        }

        json
    }
}
