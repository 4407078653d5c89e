//! Contiguous runs of best-chain links, used as download windows

use crate::blockchain::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    pub hash: Hash256,
    pub parent_hash: Hash256,
    pub height: u32,
}

/// Read-only snapshot of a contiguous run of headers, lowest height first,
/// ending at a head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubChain {
    links: Vec<ChainLink>,
}

impl SubChain {
    /// `links` must be contiguous and ascending.
    pub fn from_links(links: Vec<ChainLink>) -> Self {
        debug_assert!(links
            .windows(2)
            .all(|w| w[1].height == w[0].height + 1 && w[1].parent_hash == w[0].hash));
        SubChain { links }
    }

    pub fn head(&self) -> Option<&ChainLink> {
        self.links.last()
    }

    pub fn first_height(&self) -> Option<u32> {
        self.links.first().map(|l| l.height)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, offset: usize) -> Option<&ChainLink> {
        self.links.get(offset)
    }

    pub fn get_by_height(&self, height: u32) -> Option<&ChainLink> {
        let first = self.first_height()?;
        let offset = height.checked_sub(first)? as usize;
        self.links.get(offset)
    }

    pub fn contains_height(&self, height: u32) -> bool {
        self.get_by_height(height).is_some()
    }

    /// Append `link` if it is a direct child of the current head.
    pub fn extend(&mut self, link: ChainLink) -> bool {
        match self.links.last() {
            Some(head) if head.hash == link.parent_hash && head.height + 1 == link.height => {
                self.links.push(link);
                true
            }
            None => {
                self.links.push(link);
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainLink> {
        self.links.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(height: u32) -> ChainLink {
        ChainLink {
            hash: [height as u8 + 1; 32],
            parent_hash: [height as u8; 32],
            height,
        }
    }

    #[test]
    fn test_random_access() {
        let chain = SubChain::from_links((5..9).map(link).collect());
        assert_eq!(chain.len(), 4);
        assert_eq!(chain.first_height(), Some(5));
        assert_eq!(chain.head().map(|l| l.height), Some(8));
        assert_eq!(chain.get(1).map(|l| l.height), Some(6));
        assert_eq!(chain.get_by_height(7), chain.get(2));
        assert!(chain.get_by_height(4).is_none());
        assert!(chain.get_by_height(9).is_none());
    }

    #[test]
    fn test_extend_only_by_direct_child() {
        let mut chain = SubChain::from_links(vec![link(1), link(2)]);
        assert!(!chain.extend(link(4)));

        let mut stranger = link(3);
        stranger.parent_hash = [0xee; 32];
        assert!(!chain.extend(stranger));

        assert!(chain.extend(link(3)));
        assert_eq!(chain.head().map(|l| l.height), Some(3));
    }
}
