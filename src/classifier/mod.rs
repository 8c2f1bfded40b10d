//! Email classification: prompt construction, provider call, reply parsing.
//!
//! Flow:
//! 1. Build a Spanish prompt from sender, subject and a body snippet
//! 2. Send it through the [`ProviderSelector`]
//! 3. Parse the reply: JSON first, keyword rules second, default last

pub mod rules;

pub use rules::{ClassificationRules, CompiledRules, normalize_amount};

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ClassificationError;
use crate::llm::{CompletionRequest, ProviderSelector};
use crate::pipeline::types::{Category, ClassificationResult, Email, Priority};

/// Body characters included in the prompt.
const PROMPT_BODY_CHARS: usize = 1000;

/// Subject characters used as a summary when the model gives none.
const SUMMARY_CHARS: usize = 100;

/// Classifies emails through the configured providers.
pub struct Classifier {
    selector: ProviderSelector,
    rules: CompiledRules,
}

impl Classifier {
    pub fn new(selector: ProviderSelector, rules: CompiledRules) -> Self {
        Self { selector, rules }
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    /// Classify one email. Fails only when no provider produced a reply.
    pub async fn classify(
        &mut self,
        email: &Email,
    ) -> Result<ClassificationResult, ClassificationError> {
        let request = CompletionRequest::new(build_prompt(email));
        let done = self.selector.complete(&request).await?;

        let result = parse_reply(&done.response.content, email, &self.rules);
        info!(
            id = %email.id,
            provider = %done.provider,
            category = %result.category,
            priority = %result.priority,
            amount = ?result.amount,
            "Classified email"
        );
        Ok(result)
    }
}

/// Build the classification prompt for an email.
pub fn build_prompt(email: &Email) -> String {
    let body = truncate_chars(&email.body, PROMPT_BODY_CHARS);
    format!(
        r#"Eres un asistente que clasifica correos bancarios en español.

Analiza este correo y responde SOLO con un JSON (sin explicaciones adicionales):

Remitente: {sender}
Asunto: {subject}
Cuerpo: {body}

Clasifica el correo en:

1. CATEGORÍA (elige una):
   - "pago": Pagos que debo hacer, cargos, domiciliaciones
   - "transferencia": Transferencias recibidas o realizadas
   - "estado_cuenta": Estados de cuenta, resúmenes
   - "movimiento": Movimientos, retiros, depósitos
   - "promocion": Promociones, ofertas, publicidad
   - "notificacion": Notificaciones generales del banco

2. PRIORIDAD (elige una):
   - "urgente": Requiere acción inmediata (pagos pendientes, verificaciones)
   - "normal": Informativo importante (movimientos, transferencias)
   - "sin_prioridad": No requiere acción (promociones, newsletter)

3. RESUMEN: Una línea describiendo el correo. Si es un pago o transferencia,
   menciona el monto así: "Pago de $X en [lugar]" o "Transferencia de $X"

4. MONTO: el monto principal del correo como número, o null si no hay.

Responde EXACTAMENTE en este formato JSON:
{{
  "category": "categoria_aqui",
  "priority": "prioridad_aqui",
  "summary": "resumen_aqui",
  "amount": null,
  "action_required": true
}}"#,
        sender = email.sender,
        subject = email.subject,
    )
}

/// Turn a model reply into a classification. Never fails.
pub fn parse_reply(reply: &str, email: &Email, rules: &CompiledRules) -> ClassificationResult {
    let default_summary = truncate_chars(&email.subject, SUMMARY_CHARS);
    let email_text = format!("{} {}", email.subject, email.body);

    if let Some(parsed) = parse_json_reply(reply, rules) {
        let amount = parsed
            .amount
            .or_else(|| rules.amount_in(reply))
            .or_else(|| rules.amount_in(&email_text));
        return ClassificationResult {
            category: parsed.category,
            priority: parsed.priority,
            amount,
            summary: parsed.summary.unwrap_or(default_summary),
            action_required: parsed
                .action_required
                .unwrap_or(parsed.priority.is_urgent()),
        };
    }

    debug!(id = %email.id, "Reply has no usable JSON, matching keywords");
    let amount = rules
        .amount_in(reply)
        .or_else(|| rules.amount_in(&email_text));

    let category = rules.category_in(reply);
    let priority = rules.priority_in(reply);
    let (category, priority) = match (category, priority) {
        (None, None) => {
            return ClassificationResult {
                amount,
                ..ClassificationResult::fallback(default_summary)
            };
        }
        (Some(c), None) => (c, Priority::Normal),
        (None, Some(p)) => (Category::Notificacion, p),
        (Some(c), Some(p)) => (c, p),
    };

    ClassificationResult {
        category,
        priority,
        amount,
        summary: default_summary,
        action_required: priority.is_urgent(),
    }
}

struct JsonReply {
    category: Category,
    priority: Priority,
    summary: Option<String>,
    action_required: Option<bool>,
    amount: Option<Decimal>,
}

/// Accept a JSON reply only if both category and priority are known values.
fn parse_json_reply(reply: &str, rules: &CompiledRules) -> Option<JsonReply> {
    let value = extract_json_object(reply)?;
    let category = value.get("category")?.as_str()?.parse::<Category>().ok()?;
    let priority = value.get("priority")?.as_str()?.parse::<Priority>().ok()?;

    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let action_required = match value.get("action_required") {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "si" | "sí" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    };

    let amount = match value.get("amount") {
        Some(Value::Number(n)) => Decimal::from_str_exact(&n.to_string())
            .ok()
            .filter(|d| d.is_sign_positive()),
        Some(Value::String(s)) => rules.amount_in(s).or_else(|| normalize_amount(s)),
        _ => None,
    };

    Some(JsonReply {
        category,
        priority,
        summary,
        action_required,
        amount,
    })
}

/// Extract a JSON object from model output: bare, fenced, or embedded in prose.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if trimmed.starts_with('{')
        && let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed)
    {
        return Some(value);
    }

    // Markdown code block, with or without a language tag
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```")
            && let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(after[..end].trim())
        {
            return Some(value);
        }
    }

    // Outermost braces
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
        && let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&trimmed[start..=end])
    {
        return Some(value);
    }

    None
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
