pub mod ollama;
pub mod remote;

use serde_json::Value;
use tracing::debug;

/// Prompt shared by the chat and completion backends. `context` is rendered
/// as pretty JSON so table descriptions survive verbatim.
pub(crate) fn prepare_prompt(question: &str, context: &Value) -> String {
    let context_text = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
    format!(
        r#"
### Instructions:
Your task is to convert a question into a SQL query for DuckDB, given the context it runs in.
Adhere to these rules:
- **Use the exact spelling of table and column names as provided in the context**
- **Deliberately go through the question and context word by word** to appropriately answer the question
- **Use Table Aliases** to prevent ambiguity. For example, `SELECT table1.col1, table2.col1 FROM table1 JOIN table2 ON table1.id = table2.id`.
- When creating a ratio, always cast the numerator as float

### Input:
Generate a SQL query that answers the question `{}`.
This query will run with the following context:

{}

### Response:
Based on your instructions, here is the SQL query I have generated to answer the question `{}`:
```sql
"#,
        question, context_text, question
    )
}

/// Pulls the statement out of a model reply: a fenced block if present,
/// otherwise the first line that starts like SQL, otherwise the reply.
pub(crate) fn extract_sql(content: &str) -> String {
    if let Some(start) = content.find("```sql") {
        let after = &content[start + 6..];
        let end = after.find("```").unwrap_or(after.len());
        return after[..end].trim().to_string();
    }

    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    let sql_keywords = ["SELECT", "WITH"];
    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let upper = line.trim().to_uppercase();
        if sql_keywords.iter().any(|kw| upper.starts_with(kw)) {
            let mut sql = line.trim().to_string();
            for next in lines.iter().skip(i + 1).map(|l| l.trim()) {
                if next.starts_with("```") {
                    break;
                }
                sql.push(' ');
                sql.push_str(next);
                if next.ends_with(';') {
                    break;
                }
            }
            debug!("Extracted SQL by line scanning");
            return sql.trim().to_string();
        }
    }

    // the prompt ends inside an open ```sql fence, so a bare reply is SQL
    content.trim().trim_end_matches("```").trim().to_string()
}
