use async_trait::async_trait;
use std::sync::Arc;

use crate::llm::{truncate_on_boundary, Completion};
use crate::models::ChatMessage;

const MAX_QUERIES: usize = 4;
const FOLLOWUP_HISTORY_TURNS: usize = 4;
const FOLLOWUP_HISTORY_CHARS: usize = 200;

const DECOMPOSE_PROMPT: &str = r#"Eres un asistente legal. Tu tarea es generar las PALABRAS CLAVE de búsqueda necesarias para encontrar normativa relevante en una base de datos de legislación laboral y de Seguridad Social española.

RESPONDE SOLO con un JSON array de strings. Cada string es una búsqueda de 3-6 palabras clave.

Reglas:
- Cada query debe ser CORTA: solo 3-6 palabras clave relevantes. NO escribas frases completas.
- NO incluyas números de artículo (ej: "artículo 48", "art. 250"). La búsqueda semántica no los necesita.
- Incluye el término técnico-legal Y el coloquial si son distintos.
- Si la pregunta es SIMPLE (un solo concepto), devuelve UN array con una sola query.
  Ejemplo: "¿cuántos días de vacaciones tengo?" → ["vacaciones anuales retribuidas días disfrute"]
- Si la pregunta es COMPLEJA (compara o involucra varios conceptos), devuelve VARIAS queries (una por concepto).
  Ejemplo: "¿qué diferencia hay entre despido objetivo y disciplinario?" →
  ["despido objetivo causas indemnización",
   "despido disciplinario causas procedimiento"]
- Equivalencias coloquiales a términos legales:
  * "baja de maternidad" → "suspensión contrato nacimiento cuidado menor"
  * "despido" → "extinción contrato despido"
  * "paro" → "prestación desempleo"
  * "baja médica" → "incapacidad temporal prestación"
  * "pensión" → "jubilación prestación contributiva"
  * "finiquito" → "liquidación haberes extinción contrato"
- Máximo 4 queries. Agrupa conceptos cercanos si son más.

RESPONDE SOLO con el JSON array. Sin explicaciones, sin markdown, sin backticks."#;

const FOLLOWUP_PROMPT: &str = r#"Eres un asistente legal. El usuario hace una pregunta de CONTINUACIÓN sobre la conversación previa.
Ya tenemos el contexto normativo de la pregunta anterior (se inyectará automáticamente).
Tu tarea es generar SOLO las búsquedas ADICIONALES necesarias para los conceptos NUEVOS que aparecen en esta pregunta de continuación.

RESPONDE SOLO con un JSON array de strings (3-6 palabras clave cada una).
- Si la pregunta no introduce conceptos nuevos (ej: "¿puedes explicarlo mejor?"), devuelve un array vacío: []
- Si introduce conceptos nuevos, genera queries SOLO para esos conceptos nuevos.
  Ejemplo (si la conversación era sobre vacaciones): "¿y si no me las dan?" → ["sanción incumplimiento empresario vacaciones reclamación"]
- NO repitas búsquedas de conceptos que ya se trataron en la conversación anterior.
- Máximo 3 queries nuevas.

RESPONDE SOLO con el JSON array. Sin explicaciones, sin markdown, sin backticks."#;

/// Turns a user question into short keyword search queries.
///
/// Implementations never fail: any breakdown degrades to searching the
/// question verbatim. An empty list means a pure continuation with nothing
/// new to search.
#[async_trait]
pub trait QueryDecomposer: Send + Sync {
    async fn decompose(&self, question: &str, history: &[ChatMessage], follow_up: bool)
        -> Vec<String>;
}

/// Decomposer backed by a chat completion model.
pub struct LlmDecomposer {
    llm: Arc<dyn Completion>,
}

impl LlmDecomposer {
    pub fn new(llm: Arc<dyn Completion>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl QueryDecomposer for LlmDecomposer {
    async fn decompose(
        &self,
        question: &str,
        history: &[ChatMessage],
        follow_up: bool,
    ) -> Vec<String> {
        let messages = build_messages(question, history, follow_up);

        match self.llm.complete(&messages).await {
            Ok(reply) => parse_queries(&reply).unwrap_or_else(|| {
                tracing::warn!("Unparseable decomposition reply, searching it raw");
                let raw = reply.trim();
                if raw.is_empty() {
                    vec![question.to_string()]
                } else {
                    vec![raw.to_string()]
                }
            }),
            Err(e) => {
                tracing::warn!("Query decomposition failed, using original question: {e:#}");
                vec![question.to_string()]
            }
        }
    }
}

fn build_messages(question: &str, history: &[ChatMessage], follow_up: bool) -> Vec<ChatMessage> {
    let prompt = if follow_up {
        FOLLOWUP_PROMPT
    } else {
        DECOMPOSE_PROMPT
    };
    let mut messages = vec![ChatMessage::new("system", prompt)];

    if follow_up {
        let start = history.len().saturating_sub(FOLLOWUP_HISTORY_TURNS);
        for msg in &history[start..] {
            if msg.role == "user" || msg.role == "assistant" {
                messages.push(ChatMessage::new(
                    msg.role.clone(),
                    truncate_on_boundary(&msg.content, FOLLOWUP_HISTORY_CHARS),
                ));
            }
        }
    }

    // The question must close the exchange, unless the tail already ends
    // with it.
    let already_last = messages
        .last()
        .is_some_and(|m| m.role == "user" && m.content == question);
    if !already_last {
        messages.push(ChatMessage::new("user", question));
    }

    messages
}

fn parse_queries(content: &str) -> Option<Vec<String>> {
    // Extract the JSON array, tolerating fences and surrounding prose.
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    if end < start {
        return None;
    }

    let queries: Vec<String> = serde_json::from_str(&content[start..=end]).ok()?;
    Some(queries.into_iter().take(MAX_QUERIES).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    struct Canned(&'static str);

    #[async_trait]
    impl Completion for Canned {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl Completion for Failing {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            anyhow::bail!("model offline")
        }
    }

    #[test]
    fn test_parse_clean_array() {
        let queries = parse_queries(r#"["vacaciones anuales retribuidas días"]"#).unwrap();
        assert_eq!(queries, vec!["vacaciones anuales retribuidas días"]);
    }

    #[test]
    fn test_parse_fenced_array() {
        let input = "```json\n[\"despido objetivo causas\", \"despido disciplinario\"]\n```";
        let queries = parse_queries(input).unwrap();
        assert_eq!(queries.len(), 2);
    }

    #[test]
    fn test_parse_array_embedded_in_prose() {
        let input = "Aquí tienes:\n[\"prestación desempleo requisitos\"]\nEspero que sirva.";
        let queries = parse_queries(input).unwrap();
        assert_eq!(queries, vec!["prestación desempleo requisitos"]);
    }

    #[test]
    fn test_parse_caps_at_four() {
        let queries = parse_queries(r#"["a", "b", "c", "d", "e", "f"]"#).unwrap();
        assert_eq!(queries.len(), 4);
    }

    #[test]
    fn test_parse_empty_array_is_a_valid_answer() {
        // A pure continuation: nothing new to search.
        let queries = parse_queries("[]").unwrap();
        assert!(queries.is_empty());
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_queries("no entiendo la pregunta").is_none());
        assert!(parse_queries("[\"sin cierre").is_none());
        assert!(parse_queries("] al revés [").is_none());
    }

    #[test]
    fn test_initial_messages_are_prompt_plus_question() {
        let history = vec![
            ChatMessage::new("user", "hola"),
            ChatMessage::new("assistant", "buenas"),
        ];
        let messages = build_messages("¿cuántos días de vacaciones tengo?", &history, false);

        // Initial mode ignores the tail entirely.
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "¿cuántos días de vacaciones tengo?");
    }

    #[test]
    fn test_followup_messages_carry_recent_tail() {
        let history = vec![
            ChatMessage::new("user", "turno viejo"),
            ChatMessage::new("user", "¿vacaciones?"),
            ChatMessage::new("assistant", "30 días naturales"),
            ChatMessage::new("system", "interno"),
            ChatMessage::new("assistant", "x".repeat(500)),
        ];
        let messages = build_messages("¿y si no me las dan?", &history, true);

        // Last 4 turns, system role discarded, long content truncated.
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[1].content, "¿vacaciones?");
        assert_eq!(messages[3].content.len(), 200);
        assert_eq!(messages[4].content, "¿y si no me las dan?");
    }

    #[test]
    fn test_question_not_duplicated_when_tail_ends_with_it() {
        let history = vec![
            ChatMessage::new("assistant", "respuesta previa"),
            ChatMessage::new("user", "¿y los festivos?"),
        ];
        let messages = build_messages("¿y los festivos?", &history, true);
        assert_eq!(messages.last().unwrap().content, "¿y los festivos?");
        assert_eq!(
            messages
                .iter()
                .filter(|m| m.content == "¿y los festivos?")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_decompose_parses_reply() {
        let decomposer = LlmDecomposer::new(Arc::new(Canned(
            r#"["vacaciones anuales retribuidas días disfrute"]"#,
        )));
        let queries = decomposer.decompose("¿vacaciones?", &[], false).await;
        assert_eq!(queries, vec!["vacaciones anuales retribuidas días disfrute"]);
    }

    #[tokio::test]
    async fn test_decompose_falls_back_to_raw_reply() {
        let decomposer = LlmDecomposer::new(Arc::new(Canned("vacaciones retribuidas")));
        let queries = decomposer.decompose("¿vacaciones?", &[], false).await;
        assert_eq!(queries, vec!["vacaciones retribuidas"]);
    }

    #[tokio::test]
    async fn test_decompose_falls_back_to_question_on_error() {
        let decomposer = LlmDecomposer::new(Arc::new(Failing));
        let queries = decomposer.decompose("¿cuánto paro me queda?", &[], false).await;
        assert_eq!(queries, vec!["¿cuánto paro me queda?"]);
    }
}
