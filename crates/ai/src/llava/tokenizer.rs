use crate::constants::DEFAULT_IMAGE_TOKEN;
use tokenizers::Tokenizer;

/// Input prompt: "A photo of <image> next to <image>"
/// Output: [bos_token_id, ...(tokens for "A photo of"), image_token_index, ...(tokens for " next to "), image_token_index]
pub fn tokenizer_image_token(
    prompt: &str,
    tokenizer: &Tokenizer,
    bos_token_id: i64,
    image_token_index: i64,
) -> anyhow::Result<Vec<i64>> {
    let prompt_chunks = prompt
        .split(DEFAULT_IMAGE_TOKEN)
        .map(|s| {
            tokenizer
                .encode(s, true)
                .map(|encoding| encoding.get_ids().iter().map(|x| *x as i64).collect())
                .map_err(anyhow::Error::msg)
        })
        .collect::<anyhow::Result<Vec<Vec<i64>>>>()?;

    Ok(join_prompt_chunks(
        prompt_chunks,
        bos_token_id,
        image_token_index,
    ))
}

/// Every chunk was tokenized on its own, so each may start with BOS. Only the first
/// BOS is kept, and one image sentinel goes between consecutive chunks.
pub fn join_prompt_chunks(
    prompt_chunks: Vec<Vec<i64>>,
    bos_token_id: i64,
    image_token_index: i64,
) -> Vec<i64> {
    let mut input_ids = Vec::new();
    let mut offset = 0;
    if prompt_chunks
        .first()
        .and_then(|chunk| chunk.first())
        .is_some_and(|id| *id == bos_token_id)
    {
        offset = 1;
        input_ids.push(bos_token_id);
    }

    for x in insert_separator(
        prompt_chunks,
        duplicate_vec(&[image_token_index], offset + 1),
    )
    .iter()
    {
        input_ids.extend(x.iter().skip(offset))
    }
    input_ids
}

fn duplicate_vec<T>(vec: &[T], n: usize) -> Vec<T>
where
    T: Clone,
{
    let mut res = Vec::new();
    for _ in 0..n {
        res.extend(vec.to_owned());
    }
    res
}

fn insert_separator<T>(x: Vec<Vec<T>>, sep: Vec<T>) -> Vec<Vec<T>>
where
    T: Clone,
{
    let len = x.len();
    let mut res = Vec::with_capacity(len * 2);
    for (i, chunk) in x.into_iter().enumerate() {
        res.push(chunk);
        if i + 1 < len {
            res.push(sep.clone());
        }
    }
    res
}
