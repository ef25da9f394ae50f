//! Dependency sets for invalidation routing.

use std::collections::HashSet;

use lamina_core::FetchError;

use crate::fetcher::MetadataCache;

/// Every type visited when walking `links` from `source_type`, the source
/// and each intermediate type included.
///
/// Link targets come from metadata, so this may fetch. A link missing from
/// its type's metadata fails with `LinkNotFound`.
pub(crate) async fn traversal_types(
    metadata: &MetadataCache,
    source_type: &str,
    links: &[String],
) -> Result<HashSet<String>, FetchError> {
    let mut types = HashSet::from([source_type.to_string()]);
    let mut current = source_type.to_string();
    for link in links {
        let described = metadata.get(&current).await?;
        let target = described
            .link_target(link)
            .ok_or_else(|| FetchError::LinkNotFound {
                object_type: current.clone(),
                link: link.clone(),
            })?
            .to_string();
        types.insert(target.clone());
        current = target;
    }
    Ok(types)
}
