//! Campaign definition checks, applied before anything reaches the store.

use std::collections::HashSet;

use chrono_tz::Tz;

use crate::connection::validate_tenant_id;
use crate::store::campaigns::{NewCampaign, NewStep};
use crate::store::recipients::NewRecipient;
use crate::transport::normalize_phone;

use super::CampaignError;

fn invalid(msg: impl Into<String>) -> CampaignError {
    CampaignError::Invalid(msg.into())
}

/// Validate a new campaign and normalise its recipient phone numbers.
///
/// # Errors
///
/// Returns [`CampaignError::Invalid`] naming the first problem found.
pub fn new_campaign(campaign: &mut NewCampaign) -> Result<(), CampaignError> {
    if campaign.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if validate_tenant_id(&campaign.instance_id).is_err() {
        return Err(invalid(format!(
            "instance_id {:?} is not a valid tenant id",
            campaign.instance_id
        )));
    }
    delays(campaign.min_delay_ms, campaign.max_delay_ms)?;
    daily_limit(campaign.daily_limit)?;
    timezone(&campaign.timezone)?;
    steps(&campaign.steps)?;
    recipients(&mut campaign.recipients)?;
    Ok(())
}

/// Delay bounds must be ordered.
///
/// # Errors
///
/// Returns [`CampaignError::Invalid`] when `min_ms > max_ms`.
pub fn delays(min_ms: u64, max_ms: u64) -> Result<(), CampaignError> {
    if min_ms > max_ms {
        return Err(invalid(format!(
            "min_delay_ms ({min_ms}) exceeds max_delay_ms ({max_ms})"
        )));
    }
    Ok(())
}

/// The daily limit must allow at least one send.
///
/// # Errors
///
/// Returns [`CampaignError::Invalid`] for zero.
pub fn daily_limit(limit: u32) -> Result<(), CampaignError> {
    if limit == 0 {
        return Err(invalid("daily_limit must be at least 1"));
    }
    Ok(())
}

/// The timezone must be an IANA name.
///
/// # Errors
///
/// Returns [`CampaignError::Invalid`] for unknown names.
pub fn timezone(name: &str) -> Result<(), CampaignError> {
    name.parse::<Tz>()
        .map(|_| ())
        .map_err(|_| invalid(format!("unknown timezone {name:?}")))
}

/// Steps must be numbered 1..N without gaps, and media steps need a URL.
///
/// # Errors
///
/// Returns [`CampaignError::Invalid`] naming the offending step.
pub fn steps(steps: &[NewStep]) -> Result<(), CampaignError> {
    let mut orders: Vec<u32> = steps.iter().map(|s| s.step_order).collect();
    orders.sort_unstable();
    for (expected, actual) in (1_u32..).zip(&orders) {
        if *actual != expected {
            return Err(invalid(format!(
                "step orders must be 1..{} without gaps or duplicates, found {orders:?}",
                orders.len()
            )));
        }
    }

    for step in steps {
        if !step.message_type.has_media() {
            if step.message_text.trim().is_empty() {
                return Err(invalid(format!(
                    "step {} is a text step with no text",
                    step.step_order
                )));
            }
            continue;
        }
        let Some(url) = step.media_url.as_deref() else {
            return Err(invalid(format!(
                "step {} ({}) needs a media_url",
                step.step_order,
                step.message_type.as_str()
            )));
        };
        if url::Url::parse(url).is_err() {
            return Err(invalid(format!(
                "step {} has an unparseable media_url {url:?}",
                step.step_order
            )));
        }
    }
    Ok(())
}

/// Normalise phone numbers to digits and reject empty or duplicate ones.
///
/// # Errors
///
/// Returns [`CampaignError::Invalid`] naming the offending number.
pub fn recipients(recipients: &mut [NewRecipient]) -> Result<(), CampaignError> {
    let mut seen = HashSet::new();
    for recipient in recipients.iter_mut() {
        let digits = normalize_phone(&recipient.phone_number);
        if digits.is_empty() {
            return Err(invalid(format!(
                "recipient phone {:?} has no digits",
                recipient.phone_number
            )));
        }
        if !seen.insert(digits.clone()) {
            return Err(invalid(format!("duplicate recipient phone {digits}")));
        }
        recipient.phone_number = digits;
        if recipient.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            recipient.name = None;
        }
    }
    Ok(())
}
