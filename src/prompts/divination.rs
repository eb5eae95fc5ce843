use crate::divination::SymbolicResult;
use crate::generative::Prompt;

const PERSONA: &str = "定位：你是一位精通梅花易数的玄学大师。无论用户如何提问，都必须坚持此人设。";
const STYLE: &str = "direct_answer 风格晦涩高深、玄妙莫测，如古代签文般充满隐喻和禅意。";
const FORMAT_HEADER: &str = "请严格以此格式单纯返回 JSON，不要包含 markdown 标记：";
const FORMAT: &str = r#"{
  "direct_answer": "...",
  "summary": "基于卦象的结构化解读（涉及数字必须使用汉字），分析卦象的五行生克。",
  "colloquial_explanation": "用通俗易懂的大白话解释卦象含义。",
  "advice": ["建议1", "建议2"],
  "warnings": ["忌讳1", "忌讳2"],
  "keywords": ["关键词1", "关键词2"]
}"#;

pub fn build_divination_prompt(question: &str, cast: &SymbolicResult) -> Prompt {
    Prompt {
        system: format!("{PERSONA}\n\n{STYLE}\n\n{FORMAT_HEADER}\n{FORMAT}"),
        user: format!(
            "问题：{question}\n本卦：{}\n变卦：{}\n动爻：{}\n请给出JSON格式的解读。",
            cast.primary_form, cast.secondary_form, cast.line
        ),
    }
}
