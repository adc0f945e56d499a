//! `FormPage` backed by a live CDP page session.
//!
//! Foundation:
//! - K_i: Every locator is an ordered selector list; the first match wins
//! - B_i: The page may load slowly or not at all → navigate, then reload
//! - I^B: The endpoint response is observed from network events, off the
//!   driver's task, and reported through the attempt's ConfirmationWatch

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::page::PageSession;
use super::protocol::CdpEvent;
use crate::models::{Backoff, BrowserConfig, PledgeError, Result, Row, TargetConfig};
use crate::pipeline::{Confirmation, ConfirmationWatch, FormPage, RetryPolicy};

/// Pause after the load event before touching the form.
const SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Pause between scrolling the submit control into view and clicking it.
const SCROLL_DELAY: Duration = Duration::from_millis(500);

/// Pause between navigation attempts.
const NAVIGATION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// JPEG quality of error screenshots.
const SCREENSHOT_QUALITY: u8 = 80;

/// Elements scanned for challenge text.
const CHALLENGE_SCAN_LIMIT: usize = 200;

/// The configured form, driven through a page session.
pub struct CdpFormPage {
    page: Arc<PageSession>,
    target: TargetConfig,
    navigation_timeout: Duration,
    navigation: RetryPolicy,
}

impl CdpFormPage {
    pub fn new(page: PageSession, target: TargetConfig, browser: &BrowserConfig) -> Self {
        Self {
            page: Arc::new(page),
            target,
            navigation_timeout: Duration::from_secs(browser.navigation_timeout_secs),
            navigation: RetryPolicy::new(
                browser.navigation_attempts,
                NAVIGATION_RETRY_DELAY,
                Backoff::Fixed,
            ),
        }
    }

    /// Target ID of the underlying page, for closing it.
    pub fn target_id(&self) -> &str {
        self.page.target_id()
    }
}

#[async_trait]
impl FormPage for CdpFormPage {
    async fn open(&mut self) -> Result<()> {
        let page = &self.page;
        let url = self.target.url.as_str();
        let timeout = self.navigation_timeout;

        self.navigation
            .retry("open form", |attempt| async move {
                let loaded = if attempt == 1 {
                    page.navigate(url, timeout).await
                } else {
                    page.reload(timeout).await
                };
                loaded.map_err(|e| PledgeError::Navigation(e.to_string()))
            })
            .await?;

        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }

    async fn detect_challenge(&mut self) -> Result<Option<String>> {
        let fragment = self.target.challenge_frame.to_lowercase();
        if !fragment.is_empty() {
            let frames = self.page.frame_urls().await?;
            if let Some(url) = frames.iter().find(|u| u.to_lowercase().contains(&fragment)) {
                return Ok(Some(format!("frame {url}")));
            }
        }

        if self.target.challenge_markers.is_empty() {
            return Ok(None);
        }
        let found = self
            .page
            .evaluate(&challenge_script(&self.target.challenge_markers))
            .await?;
        Ok(found.as_str().map(|marker| format!("text \"{marker}\"")))
    }

    async fn fill(&mut self, row: &Row) -> Result<()> {
        let outcome = self.page.evaluate(&fill_script(&self.target, row)).await?;

        match outcome["missing"].as_str() {
            Some("phone") => Err(missing_field("phone", &self.target.phone_selectors)),
            Some("pledge") => Err(missing_field("pledge", &self.target.pledge_selectors)),
            Some(other) => Err(PledgeError::FieldNotFound(other.to_string())),
            None => {
                debug!(
                    row = row.index,
                    selects = outcome["selects"].as_u64().unwrap_or(0),
                    consent_clicked = outcome["consent"].as_bool().unwrap_or(false),
                    "Form filled"
                );
                Ok(())
            }
        }
    }

    async fn arm_confirmation(&mut self) -> Result<ConfirmationWatch> {
        // Subscribe before submit so the response cannot slip past.
        let events = self.page.subscribe();
        let page = Arc::clone(&self.page);
        let fragment = self.target.success_endpoint.clone();
        let (tx, watch) = ConfirmationWatch::channel();

        let observer = tokio::spawn(async move {
            if watch_endpoint(&page, events, &fragment).await {
                let _ = tx.send(Confirmation::EndpointResponse);
            }
        });

        Ok(watch.with_observer(observer))
    }

    async fn submit(&mut self) -> Result<()> {
        let located = self
            .page
            .evaluate(&locate_script(&self.target.submit_selectors))
            .await?;

        if located.is_null() {
            return Err(missing_field("submit", &self.target.submit_selectors));
        }

        let center = located["x"].as_f64().zip(located["y"].as_f64());
        if let Some((x, y)) = center {
            tokio::time::sleep(SCROLL_DELAY).await;
            match self.page.click(x, y).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "Mouse click failed, falling back to script click"),
            }
        }

        let clicked = self
            .page
            .evaluate(&script_click(&self.target.submit_selectors))
            .await?;
        if clicked.as_bool().unwrap_or(false) {
            Ok(())
        } else {
            Err(missing_field("submit", &self.target.submit_selectors))
        }
    }

    async fn page_confirmation(&mut self) -> Result<Option<Confirmation>> {
        let seen = self
            .page
            .evaluate(&confirmation_script(&self.target))
            .await?;
        Ok(match seen.as_str() {
            Some("indicator") => Some(Confirmation::IndicatorVisible),
            Some("text") => Some(Confirmation::SuccessText),
            _ => None,
        })
    }

    async fn capture_diagnostics(&mut self, dir: &Path, stamp: &str) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PledgeError::io("creating diagnostics dir", e))?;

        let mut written = Vec::with_capacity(2);

        let screenshot = dir.join(format!("error-{stamp}.jpg"));
        let image = self.page.screenshot_jpeg(SCREENSHOT_QUALITY).await?;
        tokio::fs::write(&screenshot, image)
            .await
            .map_err(|e| PledgeError::io("writing screenshot", e))?;
        written.push(screenshot);

        let dump = dir.join(format!("error-{stamp}.html"));
        let html = self.page.content().await?;
        tokio::fs::write(&dump, html)
            .await
            .map_err(|e| PledgeError::io("writing page dump", e))?;
        written.push(dump);

        Ok(written)
    }
}

/// Follow network events until the submission endpoint reports success.
///
/// Returns false if the event stream closes first.
async fn watch_endpoint(
    page: &PageSession,
    mut events: broadcast::Receiver<CdpEvent>,
    fragment: &str,
) -> bool {
    let mut watched: HashSet<String> = HashSet::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped = skipped, "Endpoint watcher lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return false,
        };
        if !page.owns(&event) {
            continue;
        }

        match event.method.as_str() {
            "Network.responseReceived" => {
                let id = event.param_str("/requestId");
                let url = event.param_str("/response/url");
                if let (Some(id), Some(url)) = (id, url) {
                    if url.contains(fragment) {
                        watched.insert(id.to_string());
                    }
                }
            }
            "Network.loadingFinished" => {
                let Some(id) = event.param_str("/requestId") else {
                    continue;
                };
                if !watched.remove(id) {
                    continue;
                }
                match page.response_body(id).await {
                    Ok(body) if endpoint_reports_success(&body) => return true,
                    Ok(_) => debug!("Submission endpoint answered without success"),
                    Err(e) => debug!(error = %e, "Could not read submission response"),
                }
            }
            _ => {}
        }
    }
}

/// True iff `body` is a JSON object whose `success` field is `true`.
pub fn endpoint_reports_success(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("success").and_then(Value::as_bool))
        .unwrap_or(false)
}

fn missing_field(field: &str, selectors: &[String]) -> PledgeError {
    PledgeError::FieldNotFound(format!("{field} (tried {})", selectors.join(", ")))
}

/// Invoke a script function with `args` passed as a JSON literal.
fn invoke(function: &str, args: Value) -> String {
    format!("({function})({args})")
}

// ═══════════════════════════════════════════════════════════════════════════
// PAGE SCRIPTS
// ═══════════════════════════════════════════════════════════════════════════

const CHALLENGE_JS: &str = r#"(args) => {
  const elements = Array.from(document.querySelectorAll("body *")).slice(0, args.limit);
  for (const el of elements) {
    const text = (el.innerText || "").toLowerCase();
    const hit = args.markers.find((m) => text.includes(m));
    if (hit) return hit;
  }
  return null;
}"#;

fn challenge_script(markers: &[String]) -> String {
    let markers: Vec<String> = markers.iter().map(|m| m.to_lowercase()).collect();
    invoke(
        CHALLENGE_JS,
        json!({"markers": markers, "limit": CHALLENGE_SCAN_LIMIT}),
    )
}

const FILL_JS: &str = r#"(args) => {
  const pick = (selectors) => {
    for (const s of selectors) {
      const el = document.querySelector(s);
      if (el) return el;
    }
    return null;
  };
  const setValue = (el, value) => {
    const proto = el instanceof HTMLTextAreaElement
      ? HTMLTextAreaElement.prototype
      : HTMLInputElement.prototype;
    el.focus();
    Object.getOwnPropertyDescriptor(proto, "value").set.call(el, value);
    el.dispatchEvent(new Event("input", { bubbles: true }));
    el.dispatchEvent(new Event("change", { bubbles: true }));
  };

  let selects = 0;
  for (const select of document.querySelectorAll(args.select)) {
    const values = Array.from(select.options).map((o) => o.value).filter((v) => v !== "");
    if (values.length === 0) continue;
    select.value = values[Math.floor(Math.random() * values.length)];
    select.dispatchEvent(new Event("change", { bubbles: true }));
    selects += 1;
  }

  const pledge = pick(args.pledgeSelectors);
  if (!pledge) return { missing: "pledge" };
  setValue(pledge, args.pledge);

  const phone = pick(args.phoneSelectors);
  if (!phone) return { missing: "phone" };
  setValue(phone, args.phone);

  const consent = pick(args.consentSelectors);
  const clicked = !!consent && !consent.checked;
  if (clicked) consent.click();

  return { missing: null, selects, consent: clicked };
}"#;

fn fill_script(target: &TargetConfig, row: &Row) -> String {
    invoke(
        FILL_JS,
        json!({
            "select": target.select_selector,
            "pledgeSelectors": target.pledge_selectors,
            "phoneSelectors": target.phone_selectors,
            "consentSelectors": target.consent_selectors,
            "pledge": row.pledge,
            "phone": row.phone,
        }),
    )
}

const LOCATE_JS: &str = r#"(selectors) => {
  for (const s of selectors) {
    const el = document.querySelector(s);
    if (!el) continue;
    el.scrollIntoView({ block: "center", inline: "center" });
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) return { selector: s };
    return { selector: s, x: r.left + r.width / 2, y: r.top + r.height / 2 };
  }
  return null;
}"#;

fn locate_script(selectors: &[String]) -> String {
    invoke(LOCATE_JS, json!(selectors))
}

const CLICK_JS: &str = r#"(selectors) => {
  for (const s of selectors) {
    const el = document.querySelector(s);
    if (el) { el.click(); return true; }
  }
  return false;
}"#;

fn script_click(selectors: &[String]) -> String {
    invoke(CLICK_JS, json!(selectors))
}

const CONFIRMATION_JS: &str = r#"(args) => {
  for (const s of args.selectors) {
    const el = document.querySelector(s);
    if (!el) continue;
    const style = window.getComputedStyle(el);
    if (style.display !== "none" && style.visibility !== "hidden") return "indicator";
  }
  const text = ((document.body && document.body.innerText) || "").toLowerCase();
  return args.text && text.includes(args.text) ? "text" : null;
}"#;

fn confirmation_script(target: &TargetConfig) -> String {
    invoke(
        CONFIRMATION_JS,
        json!({
            "selectors": target.success_selectors,
            "text": target.success_text.to_lowercase(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_success_parsing() {
        assert!(endpoint_reports_success(r#"{"success":true,"id":42}"#));
        assert!(!endpoint_reports_success(r#"{"success":false}"#));
        assert!(!endpoint_reports_success(r#"{"success":"true"}"#));
        assert!(!endpoint_reports_success(r#"{"ok":true}"#));
        assert!(!endpoint_reports_success("<html>502 Bad Gateway</html>"));
        assert!(!endpoint_reports_success(""));
    }

    #[test]
    fn test_fill_script_passes_row_values_as_json() {
        let row = Row::new(3, "555-0100", "I'll \"pledge\" </script>\nagain");
        let script = fill_script(&TargetConfig::default(), &row);

        assert!(script.starts_with("((args) => {"));
        let args = script
            .rsplit_once("})(")
            .and_then(|(_, tail)| tail.strip_suffix(')'))
            .unwrap();
        let args: Value = serde_json::from_str(args).unwrap();
        assert_eq!(args["pledge"], row.pledge);
        assert_eq!(args["phone"], "555-0100");
        assert_eq!(args["phoneSelectors"][0], "#phone");
        assert_eq!(args["select"], "select");
    }

    #[test]
    fn test_challenge_script_lowercases_markers() {
        let script = challenge_script(&["CAPTCHA".to_string(), "Verify You Are Human".to_string()]);
        assert!(script.contains(r#""markers":["captcha","verify you are human"]"#));
        assert!(script.contains(r#""limit":200"#));
    }

    #[test]
    fn test_confirmation_and_submit_scripts() {
        let target = TargetConfig {
            success_text: "Pledge Submitted Successfully".to_string(),
            ..TargetConfig::default()
        };
        let script = confirmation_script(&target);
        assert!(script.contains(r##""selectors":["#pledgeSuccess"]"##));
        assert!(script.contains(r#""text":"pledge submitted successfully""#));

        let selectors = vec!["#submitBtn".to_string()];
        assert!(locate_script(&selectors).ends_with(r##"})(["#submitBtn"])"##));
        assert!(script_click(&selectors).ends_with(r##"})(["#submitBtn"])"##));
    }

    #[test]
    fn test_missing_field_lists_selectors() {
        let err = missing_field("phone", &["#phone".to_string(), "input[type='tel']".to_string()]);
        assert_eq!(
            err.to_string(),
            "Form field not found: phone (tried #phone, input[type='tel'])"
        );
        assert!(err.is_retryable());
    }
}
