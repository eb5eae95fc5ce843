use crate::divination::SymbolicResult;
use crate::generative::Prompt;
use crate::worker::compatibility::CompatibilityRequest;

const PERSONA: &str = "你是一位精通八字命理（四柱）与梅花易数的合婚大师。\n你需要结合双方的出生时间和本卦卦象，给出深度的情感分析。";
const STEPS: &[&str] = &[
    "排盘：根据提供的生辰推演双方八字五行，分析日柱的刑冲合害关系。",
    "解卦：根据梅花易数解本卦（现状）与变卦（趋势）。",
    "合参：将命理基础与卦象趋势结合，判断缘分深浅与发展走向。",
];
const FORMAT: &str = r#"输出格式必须为纯JSON，不要包含markdown标记：
{
  "score": 85,
  "keyword": "天作之合/情深缘浅/...",
  "bazi_analysis": "双方八字五行分析...",
  "hexagram_analysis": "卦象分析...",
  "story_interpretation": "结合用户故事的解读...",
  "advice": ["建议1", "建议2"],
  "poem": "一首总结性的诗词"
}"#;

pub fn build_compatibility_prompt(request: &CompatibilityRequest, cast: &SymbolicResult) -> Prompt {
    let steps = STEPS
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect::<Vec<_>>()
        .join("\n");

    Prompt {
        system: format!("{PERSONA}\n\n分析步骤：\n{steps}\n\n{FORMAT}"),
        user: format!(
            "甲方：{} ({}, {})\n乙方：{} ({}, {})\n故事背景：{}\n\n所占卦象：\n本卦：{}\n变卦：{}\n动爻：{}\n",
            request.name_a,
            request.gender_a,
            request.birth_date_a,
            request.name_b,
            request.gender_b,
            request.birth_date_b,
            request.story,
            cast.primary_form,
            cast.secondary_form,
            cast.line,
        ),
    }
}
