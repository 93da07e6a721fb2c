//! Rule templates, rendered with Tera.
//!
//! Every known placeholder is defined for every render, blank when the event
//! has no value for it, so a welcome template may mention `{{ formLink }}`
//! without failing. Names outside [`PLACEHOLDERS`] are errors.

use std::collections::BTreeMap;
use std::error::Error as StdError;

use tera::{Context, Tera};
use thiserror::Error;

use super::TriggerKind;

/// Placeholder values keyed by name, e.g. `contactName`.
pub type TemplateVars = BTreeMap<String, String>;

/// Names a template may use.
pub const PLACEHOLDERS: [&str; 12] = [
    "businessName",
    "contactName",
    "serviceType",
    "date",
    "timeSlot",
    "duration",
    "location",
    "formName",
    "formLink",
    "itemName",
    "currentStock",
    "threshold",
];

#[derive(Debug, Error)]
#[error("invalid template: {0}")]
pub struct TemplateError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTemplate {
    pub subject: &'static str,
    pub body: &'static str,
}

/// Built-in subject and HTML body for each trigger that sends email.
pub fn default_template(kind: TriggerKind) -> Option<DefaultTemplate> {
    let template = match kind {
        TriggerKind::NewContact => DefaultTemplate {
            subject: "Welcome to {{businessName}}!",
            body: "<p>Hi {{contactName}},</p><p>Thank you for reaching out to us! We're excited to connect with you.</p><p>Our team will review your message and get back to you shortly.</p><p>Best regards,<br>{{businessName}}</p>",
        },
        TriggerKind::BookingCreated => DefaultTemplate {
            subject: "Booking Confirmed - {{serviceType}}",
            body: "<p>Hi {{contactName}},</p><p>Your booking has been confirmed!</p><p><strong>Service:</strong> {{serviceType}}<br><strong>Date:</strong> {{date}}<br><strong>Time:</strong> {{timeSlot}}<br><strong>Duration:</strong> {{duration}} minutes<br><strong>Location:</strong> {{location}}</p><p>We look forward to seeing you!</p><p>Best regards,<br>{{businessName}}</p>",
        },
        TriggerKind::BookingReminder => DefaultTemplate {
            subject: "Reminder: Your appointment tomorrow at {{timeSlot}}",
            body: "<p>Hi {{contactName}},</p><p>This is a friendly reminder about your upcoming appointment:</p><p><strong>Service:</strong> {{serviceType}}<br><strong>Date:</strong> {{date}}<br><strong>Time:</strong> {{timeSlot}}<br><strong>Location:</strong> {{location}}</p><p>See you soon!</p><p>Best regards,<br>{{businessName}}</p>",
        },
        TriggerKind::FormPending => DefaultTemplate {
            subject: "Complete your form - {{formName}}",
            body: "<p>Hi {{contactName}},</p><p>We noticed you haven't completed the form: <strong>{{formName}}</strong></p><p>Please take a moment to fill it out: <a href=\"{{formLink}}\">Complete Form</a></p><p>Thank you!</p><p>Best regards,<br>{{businessName}}</p>",
        },
        TriggerKind::InventoryLow => DefaultTemplate {
            subject: "Low Stock Alert - {{itemName}}",
            body: "<p>Hi,</p><p>The following item is running low:</p><p><strong>Item:</strong> {{itemName}}<br><strong>Current Stock:</strong> {{currentStock}}<br><strong>Threshold:</strong> {{threshold}}</p><p>Please restock soon.</p><p>Best regards,<br>{{businessName}}</p>",
        },
        TriggerKind::StaffReplied => return None,
    };
    Some(template)
}

/// Renders a subject line. Values are inserted as-is.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    render_with(template, vars, false)
}

/// Renders an HTML body with every value escaped.
pub fn render_html(template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    render_with(template, vars, true)
}

/// Fails when the template does not parse or names an unknown placeholder.
pub fn validate(template: &str) -> Result<(), TemplateError> {
    render_with(template, &TemplateVars::new(), false).map(|_| ())
}

fn render_with(
    template: &str,
    vars: &TemplateVars,
    autoescape: bool,
) -> Result<String, TemplateError> {
    let mut context = Context::new();
    for name in PLACEHOLDERS {
        context.insert(name, "");
    }
    for (name, value) in vars {
        context.insert(name.as_str(), value);
    }
    Tera::one_off(template, &context, autoescape).map_err(|err| TemplateError(describe(&err)))
}

/// Tera's top-level message only names the template; the cause is nested.
fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Outer HTML document around a rendered body.
pub fn wrap_html(content: &str, business_name: &str) -> String {
    let footer = tera::escape_html(business_name);
    format!(
        "<!DOCTYPE html><html><body style=\"font-family: Arial, sans-serif; line-height: 1.6; color: #333;\">\
         <div style=\"max-width: 600px; margin: 0 auto; padding: 20px;\">{content}\
         <p style=\"margin-top: 30px; color: #666; font-size: 12px;\">This is an automated message from {footer}</p>\
         </div></body></html>"
    )
}
