use crate::alerts::{AlertDecision, CycleContext};
use crate::config::EmailConfig;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build alert email: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Sends alert emails over SMTP. Built fresh per alert so config edits
/// take effect without a restart.
pub struct EmailNotifier {
    cfg: EmailConfig,
}

impl EmailNotifier {
    pub fn new(cfg: EmailConfig) -> Self {
        Self { cfg }
    }

    pub async fn send_alert(
        &self,
        host_name: &str,
        decision: &AlertDecision,
        ctx: &CycleContext<'_>,
    ) -> Result<(), NotifyError> {
        let subject = alert_subject(host_name, decision);
        let body = alert_body(host_name, decision, ctx);

        let mut builder = Message::builder()
            .from(self.cfg.from.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.cfg.to {
            builder = builder.to(recipient.parse()?);
        }
        let message = builder.body(body)?;

        let transport = self.build_transport()?;
        transport.send(message).await?;
        info!(recipients = self.cfg.to.len(), "alert email sent");
        Ok(())
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let mut builder = if self.cfg.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.cfg.smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.cfg.smtp_host)
        };
        builder = builder.port(self.cfg.smtp_port);
        if !self.cfg.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.cfg.username.clone(),
                self.cfg.password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

fn alert_subject(host_name: &str, decision: &AlertDecision) -> String {
    format!(
        "[{}] {} alert on {}",
        decision.severity.as_str().to_uppercase(),
        decision.status,
        host_name
    )
}

fn alert_body(host_name: &str, decision: &AlertDecision, ctx: &CycleContext<'_>) -> String {
    let mut sections = vec![
        format!("Host: {host_name}"),
        format!("Time: {}", decision.timestamp.to_rfc3339()),
        String::new(),
        decision.message.clone(),
    ];
    if !ctx.persistent.is_empty() {
        sections.push(String::new());
        sections.push("Persistent usage:".to_string());
        for event in ctx.persistent {
            sections.push(format!(
                "  {} {}: peak {:.1}%, average {:.1}%, {}m and counting",
                event.username,
                event.metric,
                event.peak_usage,
                event.average_usage,
                event.duration_mins()
            ));
        }
    }
    sections.push(String::new());
    sections.push("Recommendations:".to_string());
    for rec in &decision.recommendations {
        sections.push(format!("  - {rec}"));
    }
    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertKind, Severity};
    use crate::collectors::SystemSample;
    use crate::status::SystemStatus;
    use crate::tracker::{Metric, PersistentUsageEvent};
    use chrono::Utc;

    fn decision() -> AlertDecision {
        AlertDecision {
            timestamp: Utc::now(),
            kind: AlertKind::System,
            severity: Severity::Heavy,
            status: SystemStatus::HeavyLoad,
            message: "System status: Heavy Load".to_string(),
            primary_cause: "alice (cpu: 90.0% for 65m)".to_string(),
            user_breakdown: String::new(),
            recommendations: vec!["investigate".to_string()],
        }
    }

    #[test]
    fn subject_names_host_and_severity() {
        let subject = alert_subject("web01", &decision());
        assert_eq!(subject, "[HEAVY] Heavy Load alert on web01");
    }

    #[test]
    fn body_lists_persistent_episodes_and_recommendations() {
        let system = SystemSample {
            timestamp: Utc::now(),
            cpu_percent: 85.0,
            memory_percent: 40.0,
            network_mbps: 1.0,
            load_avg_1: 1.2,
            load_avg_5: 1.0,
            load_avg_15: 0.9,
        };
        let events = vec![PersistentUsageEvent {
            username: "alice".to_string(),
            metric: Metric::Cpu,
            started_at: Utc::now(),
            duration_secs: 65 * 60,
            current_usage: 90.0,
            peak_usage: 95.0,
            average_usage: 91.0,
        }];
        let ctx = CycleContext {
            system: &system,
            users: &[],
            persistent: &events,
            status: SystemStatus::HeavyLoad,
        };
        let body = alert_body("web01", &decision(), &ctx);
        assert!(body.contains("Host: web01"));
        assert!(body.contains("alice cpu: peak 95.0%"));
        assert!(body.contains("65m and counting"));
        assert!(body.contains("- investigate"));
    }
}
