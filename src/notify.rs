/// Completion callback delivery.
///
/// One form-encoded POST per run, at most once. Delivery failures are logged
/// and swallowed; the sandbox state machine never depends on the callback.
use crate::types::RunOutcome;

pub struct Notifier {
    url: String,
    token: String,
}

impl Notifier {
    pub fn new(url: String, token: String) -> Self {
        Notifier { url, token }
    }

    /// POST the outcome to the callback URL. No retries; the response body is
    /// ignored.
    pub fn send_notification(&self, outcome: &RunOutcome) {
        let fields = form_fields(&self.token, outcome);
        let form: Vec<(&str, &str)> = fields
            .iter()
            .map(|(name, value)| (*name, value.as_str()))
            .collect();
        match ureq::post(&self.url).send_form(form) {
            Ok(response) => {
                log::debug!(
                    "notification delivered to {} ({})",
                    self.url,
                    response.status()
                );
            }
            Err(err) => {
                log::warn!("notification to {} failed: {}", self.url, err);
            }
        }
    }
}

/// Field set of the callback POST. `exit_code` is omitted entirely when the
/// run produced none; the output streams are always present, empty when the
/// guest wrote nothing.
fn form_fields(token: &str, outcome: &RunOutcome) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("token", token.to_string()),
        ("status", outcome.status.as_str().to_string()),
    ];
    if let Some(code) = outcome.exit_code {
        fields.push(("exit_code", code.to_string()));
    }
    fields.push((
        "test_output",
        String::from_utf8_lossy(&outcome.outputs.test_output).into_owned(),
    ));
    fields.push((
        "stdout",
        String::from_utf8_lossy(&outcome.outputs.stdout).into_owned(),
    ));
    fields.push((
        "stderr",
        String::from_utf8_lossy(&outcome.outputs.stderr).into_owned(),
    ));
    fields
}
