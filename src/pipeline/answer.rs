use anyhow::{Context, Result};

use crate::llm::Completion;
use crate::models::{ChatMessage, SearchResult};

pub(crate) const META_DELIMITER: &str = "===META===";
const ANSWER_HISTORY_TURNS: usize = 6;

pub(crate) const EMPTY_CONTEXT: &str =
    "No se encontraron resultados relevantes en la normativa.";

const SYSTEM_PROMPT: &str = r#"Eres un experto en legislación laboral y de Seguridad Social española.
Te proporcionamos fragmentos de normativa como contexto. Úsalos como base principal, pero puedes razonar, conectar ideas entre fragmentos, y aplicar lógica jurídica para dar respuestas completas y útiles.

Cita la ley y artículo cuando lo uses. Si algo no está cubierto por los fragmentos, amplia información en NEED.
Responde en español, de forma clara y estructurada. Tono profesional pero cercano.

Si hay contradicción entre fuentes, prevalece la de mayor rango (Ley > Reglamento > Orden).
Las normas de rango inferior solo pueden mejorar los derechos del trabajador, nunca empeorarlos.
En caso de duda, aplica la interpretación más favorable al trabajador.
Comprueba que toda la respuesta es coherente entre sí y con los fragmentos antes de concluir. Si falta información crítica, usa NEED en la sección META."#;

const ANSWER_WRAPPER: &str = r#"INSTRUCCIONES DE FORMATO DE RESPUESTA:

Responde a la pregunta del usuario usando los fragmentos de normativa proporcionados, eres un experto en seguridad social en españa.

Tu respuesta DEBE tener EXACTAMENTE estas dos secciones, separadas por el delimitador:

1. Primero tu respuesta completa al usuario.

===META===

2. Después del delimitador, metadata en formato estructurado:

USED|índices de los fragmentos que has USADO (separados por comas)
DROP|índices de fragmentos que NO aportan nada (separados por comas)
NEED|... (solo si FALTA información CRÍTICA)

Formatos de NEED (elige el apropiado):
- Si sabes el artículo exacto: NEED|número_artículo|nombre_ley (la ley es OBLIGATORIA, sin ella no podemos buscar)
- Si necesitas información pero no sabes el artículo: NEED|palabras clave de búsqueda

Reglas para META:
- USED y DROP son OBLIGATORIOS. Si todos fueron útiles, pon DROP|ninguno
- NEED es OPCIONAL. Solo si realmente falta algo imprescindible.

Ejemplos:
===META===
USED|0,2,5,7
DROP|1,3,4,6
NEED|48|Estatuto Trabajadores
NEED|régimen especial trabajadores autónomos cotización"#;

/// One gap the answer model reported: either a concrete article within a
/// named law, or free-text search keywords.
#[derive(Debug, Clone, PartialEq)]
pub enum Need {
    Article { article: String, law: String },
    Query(String),
}

/// Structured annotations parsed from the reply's META section.
#[derive(Debug, Clone, Default)]
pub struct AnswerMeta {
    pub used: Vec<usize>,
    pub drop: Vec<usize>,
    pub need: Vec<Need>,
}

/// Render the working set as a numbered context string.
pub fn build_context(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return EMPTY_CONTEXT.to_string();
    }

    let blocks: Vec<String> = results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let chunk = &result.chunk;
            let mut lines = vec![format!(
                "[{i}] {} > {}",
                chunk.law.as_deref().unwrap_or("?"),
                chunk.section.as_deref().unwrap_or("?")
            )];
            if let Some(chapter) = chunk.chapter.as_deref().filter(|c| !c.is_empty()) {
                lines.push(format!("Capítulo: {chapter}"));
            }
            if let Some(summary) = chunk.summary.as_deref().filter(|s| !s.is_empty()) {
                lines.push(format!("Resumen: {summary}"));
            }
            if let Some(text) = chunk.text.as_deref().filter(|t| !t.is_empty()) {
                lines.push(format!("Texto: {text}"));
            }
            lines.join("\n")
        })
        .collect();

    blocks.join("\n\n---\n\n")
}

fn build_messages(context: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut messages = vec![
        ChatMessage::new("system", SYSTEM_PROMPT),
        ChatMessage::new("system", format!("CONTEXTO DE NORMATIVA:\n\n{context}")),
        ChatMessage::new("system", ANSWER_WRAPPER),
    ];

    let start = history.len().saturating_sub(ANSWER_HISTORY_TURNS);
    for msg in &history[start..] {
        if msg.role == "user" || msg.role == "assistant" {
            messages.push(msg.clone());
        }
    }

    messages
}

/// Generate the final answer over the assembled context. Returns the
/// user-visible text and the parsed META annotations.
pub async fn generate(
    llm: &dyn Completion,
    context: &str,
    history: &[ChatMessage],
) -> Result<(String, AnswerMeta)> {
    let messages = build_messages(context, history);
    let raw = llm
        .complete(&messages)
        .await
        .context("Answer generation failed")?;
    Ok(split_reply(&raw))
}

/// Split a raw reply into the visible answer and its META annotations.
pub fn split_reply(raw: &str) -> (String, AnswerMeta) {
    let meta = parse_meta(raw);
    let answer = match raw.find(META_DELIMITER) {
        Some(idx) => raw[..idx].trim(),
        None => raw.trim(),
    };
    (answer.to_string(), meta)
}

/// Parse the META section. A missing delimiter or malformed lines yield
/// empty annotations, never an error.
pub fn parse_meta(raw: &str) -> AnswerMeta {
    let mut meta = AnswerMeta::default();
    let Some(idx) = raw.find(META_DELIMITER) else {
        return meta;
    };

    for line in raw[idx + META_DELIMITER.len()..].lines() {
        let trimmed = line.trim();
        if let Some(val) = trimmed.strip_prefix("USED|") {
            let val = val.trim();
            if !val.is_empty() && !val.eq_ignore_ascii_case("ninguno") {
                meta.used = parse_index_list(val);
            }
        } else if let Some(val) = trimmed.strip_prefix("DROP|") {
            let val = val.trim();
            if !val.is_empty() && !val.eq_ignore_ascii_case("ninguno") {
                meta.drop = parse_index_list(val);
            }
        } else if let Some(rest) = trimmed.strip_prefix("NEED|") {
            if let Some(need) = parse_need(rest) {
                meta.need.push(need);
            }
        }
    }

    meta
}

pub(crate) fn parse_index_list(val: &str) -> Vec<usize> {
    val.split(',')
        .filter_map(|s| s.trim().parse::<usize>().ok())
        .collect()
}

/// Parse the payload after `NEED|`. Two segments mean an article request
/// (the article number is extracted from whatever surrounds it); one
/// segment is a free-text query.
pub(crate) fn parse_need(rest: &str) -> Option<Need> {
    let parts: Vec<&str> = rest.split('|').collect();
    if parts.len() >= 2 {
        let article = extract_article(parts[0])?;
        return Some(Need::Article {
            article,
            law: parts[1].trim().to_string(),
        });
    }

    let query = parts.first()?.trim();
    if query.is_empty() {
        return None;
    }
    Some(Need::Query(query.to_string()))
}

/// First article number in the text: digits with an optional decimal
/// sub-article part ("48.4").
fn extract_article(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;

    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        let mut frac = end + 1;
        while frac < bytes.len() && bytes[frac].is_ascii_digit() {
            frac += 1;
        }
        if frac > end + 1 {
            end = frac;
        }
    }

    Some(text[start..end].to_string())
}
