use validator::{Validate, ValidationErrors};

use crate::error::{AppError, AppResult};

/// Run `validator` rules and fold every field error into one `InvalidInput`.
pub fn validate_request<T: Validate>(value: &T) -> AppResult<()> {
    value
        .validate()
        .map_err(|e| AppError::InvalidInput(format!("Validation failed: {}", describe(&e))))
}

fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<String> = errors
        .field_errors()
        .into_iter()
        .map(|(field, errors)| {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            format!("{}: {}", field, messages.join(", "))
        })
        .collect();
    fields.sort();
    fields.join("; ")
}

#[cfg(test)]
mod tests {
    use validator::Validate;

    use super::*;

    #[derive(Validate)]
    struct Probe {
        #[validate(length(min = 2))]
        name: String,
        #[validate(range(max = 5))]
        count: u32,
    }

    #[test]
    fn test_every_failing_field_is_reported() {
        let err = validate_request(&Probe {
            name: "x".into(),
            count: 9,
        })
        .unwrap_err();

        let AppError::InvalidInput(message) = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(message, "Validation failed: count: range; name: length");
    }
}
