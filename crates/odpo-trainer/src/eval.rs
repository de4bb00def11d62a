//! Evaluation sampler: near-greedy completions on held-out prompts.

use mlx_rs::ops::concatenate_axis;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::{Array, Dtype};
use odpo_core::{InspectionRow, InspectionTable, RolloutConfig};

use crate::data::PromptLoader;
use crate::error::OnlineDpoResult;
use crate::generation::{GenerationConfig, SequenceGenerator};
use crate::logprob_utils::truncate_response;
use crate::models::{get_reward, ScoreModel};

/// Sample, truncate and score completions for the loader's batches.
///
/// Stops after `max_batches` batches when given, otherwise runs the loader
/// dry. Scores are the raw scorer outputs, without the eos penalty.
pub fn sample_evaluation<P, S>(
    policy: &mut P,
    scorer: &mut S,
    loader: &mut PromptLoader<'_>,
    config: &RolloutConfig,
    max_batches: Option<usize>,
) -> OnlineDpoResult<InspectionTable>
where
    P: SequenceGenerator + ?Sized,
    S: ScoreModel + ?Sized,
{
    let pad = config.pad_token_id;
    let stop_token_id = config.resolved_stop_token_id();
    let generation_config = GenerationConfig::evaluation(config);
    let mut table = InspectionTable::default();
    let mut batches = 0;

    while max_batches.map_or(true, |max| batches < max) {
        let Some(query) = loader.next_batch() else {
            break;
        };
        let context_length = query.dim(1);

        let generation = policy.generate(&query, pad, &generation_config)?;
        let response = generation.query_responses.index((.., context_length..));
        let postprocessed = truncate_response(stop_token_id, pad, &response)?;
        let postprocessed_query_response = concatenate_axis(&[&query, &postprocessed], 1)?;
        let scores = get_reward(scorer, &postprocessed_query_response, pad, context_length)?
            .as_dtype(Dtype::Float32)?;

        let queries = host_rows(&query)?;
        let responses = host_rows(&postprocessed)?;
        scores.eval()?;
        for ((query, response), score) in queries
            .iter()
            .zip(responses.iter())
            .zip(scores.as_slice::<f32>())
        {
            table.push(InspectionRow {
                query: render_tokens(query, Some(pad)),
                model_response: render_tokens(response, None),
                score: *score,
            });
        }
        batches += 1;
    }

    Ok(table)
}

/// Space-separated token ids, skipping `skip` when given.
pub fn render_tokens(tokens: &[i32], skip: Option<i32>) -> String {
    tokens
        .iter()
        .filter(|&&t| Some(t) != skip)
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn host_rows(array: &Array) -> OnlineDpoResult<Vec<Vec<i32>>> {
    let array = array.as_dtype(Dtype::Int32)?;
    array.eval()?;
    let width = array.dim(1) as usize;
    if width == 0 {
        return Ok(vec![Vec::new(); array.dim(0) as usize]);
    }
    Ok(array
        .as_slice::<i32>()
        .chunks(width)
        .map(<[i32]>::to_vec)
        .collect())
}
